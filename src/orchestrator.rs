//! Running flows: the client walks its flow descriptors one after the other,
//! the server either sweeps a range of ports sequentially or runs one worker
//! thread per queue pair.

use crate::{
    access::Role,
    completion_queue::WcStatus,
    config::{ClientOptions, FlowDescriptor, ServerOptions, ServerPlan},
    connection::{ConnectionEndpoint, Listener},
    error::FlowError,
    integrity::{fill_random, report_digest, write_greeting, Digest},
    resource::BundleConfig,
    transfer::{TransferEngine, WorkOutcome},
    verbs::{ConnParam, Verbs, DEFAULT_BACKLOG},
};
use std::{
    io::{self, BufRead},
    net::SocketAddrV4,
    sync::Arc,
    thread,
    time::SystemTime,
};
use tracing::{debug, error, info, warn};

/// What one client flow did
#[derive(Debug, Clone, PartialEq)]
pub struct FlowReport {
    /// The flow
    pub flow: FlowDescriptor,
    /// One outcome per send, in order
    pub sends: Vec<WorkOutcome>,
    /// Digest of the sent buffer in validate mode
    pub digest: Option<Digest>,
}

/// What one sequential server connection received
#[derive(Debug, Clone, PartialEq)]
pub struct ServeReport {
    /// Port the connection was accepted on
    pub port: u16,
    /// The receive
    pub outcome: WorkOutcome,
    /// Digest of the received buffer in validate mode
    pub digest: Option<Digest>,
}

/// What one multi-QP worker received before it ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    /// Port of the worker
    pub port: u16,
    /// Messages received
    pub messages: u64,
    /// Digest after every message in validate mode
    pub digests: Vec<Digest>,
}

/// Result of a server run
#[derive(Debug)]
pub enum ServerSummary {
    /// Per port results of the sequential sweep
    Sweep(Vec<(u16, Result<ServeReport, FlowError>)>),
    /// Per worker results of the concurrent mode
    MultiQp(Vec<(u16, Result<WorkerReport, FlowError>)>),
}

/// Run every client flow in order. The first failure ends the run.
///
/// In interactive mode every line read from `input` sends the buffer once
/// more over the same connection, until end of input.
pub fn run_client<V: Verbs, R: BufRead>(
    verbs: &Arc<V>,
    opts: &ClientOptions,
    mut input: R,
) -> Result<Vec<FlowReport>, FlowError> {
    let flows = opts.flows()?;
    info!("running {} flow(s)", flows.len());
    flows
        .iter()
        .map(|flow| run_flow(verbs, opts, flow, &mut input))
        .collect()
}

/// One client flow: handshake, one send (or more, interactively), teardown
fn run_flow<V: Verbs, R: BufRead>(
    verbs: &Arc<V>,
    opts: &ClientOptions,
    flow: &FlowDescriptor,
    input: &mut R,
) -> Result<FlowReport, FlowError> {
    if let Some(ts) = flow.timestamp() {
        if opts.honor_timestamps() {
            let delay = flow.delay_from(SystemTime::now());
            if !delay.is_zero() {
                info!("flow to {} scheduled at {}, waiting {:?}", flow.dst(), ts, delay);
                thread::sleep(delay);
            }
        } else {
            debug!("flow to {} carries timestamp {}", flow.dst(), ts);
        }
    }
    info!(
        "flow {} -> {} with {} bytes",
        flow.src(),
        flow.dst(),
        flow.buffer_size()
    );

    let timeouts = opts.timeouts();
    let mut ep = ConnectionEndpoint::resolve(verbs, flow.src(), flow.dst(), &timeouts)?;
    let bundle = ep.acquire(&BundleConfig::new(Role::Sender, flow.buffer_size()))?;
    if opts.fill() {
        fill_random(bundle.buffer_mut());
    } else {
        write_greeting(bundle.buffer_mut());
    }
    let digest = opts.validate().then(|| report_digest(bundle.buffer()));

    ep.connect(&ConnParam::default(), &timeouts)?;
    info!("connected to server {}", flow.dst());
    let bundle = ep.established_bundle()?;
    let engine = TransferEngine::new(&*bundle, opts.wait(), timeouts.completion);

    let mut sends = vec![send_once(&engine)?];
    if opts.interactive() {
        let mut line = String::new();
        loop {
            line.clear();
            match input.read_line(&mut line) {
                Ok(_) if line.ends_with('\n') => sends.push(send_once(&engine)?),
                // end of input, an unterminated last line does not count
                Ok(_) => break,
                Err(e) => {
                    warn!("stop repeating, can not read input: {}", e);
                    break;
                }
            }
        }
    }
    Ok(FlowReport {
        flow: *flow,
        sends,
        digest,
    })
}

/// Send the buffer once and report the execution time
fn send_once<V: Verbs>(engine: &TransferEngine<'_, V>) -> Result<WorkOutcome, FlowError> {
    let outcome = engine.send()?;
    info!("message sent, wr_id {}", outcome.wr_id);
    println!("Execution time: {:.3} ms", outcome.elapsed_ms());
    Ok(outcome)
}

/// Validate the server options and serve the ports
pub fn run_server<V: Verbs>(verbs: &Arc<V>, opts: &ServerOptions) -> Result<ServerSummary, FlowError> {
    match opts.plan()? {
        ServerPlan::Sweep { base, count } => Ok(ServerSummary::Sweep(run_sweep(
            verbs, opts, base, count,
        ))),
        ServerPlan::MultiQp { ports } => {
            Ok(ServerSummary::MultiQp(run_multi_qp(verbs, opts, &ports)))
        }
    }
}

/// Bind `addr`, wait for one client, set up its resources and accept it
fn accept_connection<V: Verbs>(
    verbs: &Arc<V>,
    addr: SocketAddrV4,
    opts: &ServerOptions,
) -> Result<ConnectionEndpoint<V>, FlowError> {
    let timeouts = opts.timeouts();
    let listener = Listener::bind(verbs, addr, DEFAULT_BACKLOG)?;
    let mut ep = listener.next_request(&timeouts)?;
    let _ = ep.acquire(&BundleConfig::new(Role::Receiver, opts.buffer_size()))?;
    ep.accept(&ConnParam::default(), &timeouts)?;
    info!("client connected on {}", addr);
    Ok(ep)
}

/// Accept one connection on `port`, receive one message and tear down
pub fn serve_once<V: Verbs>(
    verbs: &Arc<V>,
    opts: &ServerOptions,
    port: u16,
) -> Result<ServeReport, FlowError> {
    let mut ep = accept_connection(verbs, SocketAddrV4::new(opts.ip(), port), opts)?;
    let bundle = &*ep.established_bundle()?;
    let outcome = TransferEngine::new(bundle, opts.wait(), opts.timeouts().completion).receive()?;
    info!(
        "completion received on port {}, wr_id {}, byte_len {}",
        port, outcome.wr_id, outcome.byte_len
    );
    let digest = opts.validate().then(|| report_digest(bundle.buffer()));
    Ok(ServeReport {
        port,
        outcome,
        digest,
    })
}

/// Serve `count` consecutive ports from `base`, one connection each. A
/// failing port is logged and the sweep moves on.
pub fn run_sweep<V: Verbs>(
    verbs: &Arc<V>,
    opts: &ServerOptions,
    base: u16,
    count: usize,
) -> Vec<(u16, Result<ServeReport, FlowError>)> {
    (0..count)
        .map_while(|offset| u16::try_from(offset).ok().and_then(|o| base.checked_add(o)))
        .map(|port| {
            info!("starting server on port {}", port);
            let ret = serve_once(verbs, opts, port);
            if let Err(ref e) = ret {
                error!("server operation failed on port {}: {}", port, e);
            }
            (port, ret)
        })
        .collect()
}

/// One worker: accept a connection on `port` and receive on it until the
/// message bound is reached. A client that disconnects flushes the posted
/// receive, the worker then tears the connection down and accepts the next
/// client on the same port. Any other failure ends the worker.
fn worker<V: Verbs>(
    verbs: &Arc<V>,
    opts: &ServerOptions,
    port: u16,
) -> Result<WorkerReport, FlowError> {
    let addr = SocketAddrV4::new(opts.ip(), port);
    let mut report = WorkerReport {
        port,
        messages: 0,
        digests: Vec::new(),
    };
    while !bound_reached(opts, &report) {
        let mut ep = accept_connection(verbs, addr, opts)?;
        let bundle = &*ep.established_bundle()?;
        let engine = TransferEngine::new(bundle, opts.wait(), opts.timeouts().completion);
        while !bound_reached(opts, &report) {
            let outcome = match engine.receive() {
                Ok(outcome) => outcome,
                Err(FlowError::Completion {
                    status: WcStatus::WrFlushErr,
                    ..
                }) => {
                    info!("client on port {} disconnected", port);
                    break;
                }
                Err(e) => return Err(e),
            };
            report.messages = report.messages.saturating_add(1);
            info!(
                "port {}: message {} with {} bytes",
                port, report.messages, outcome.byte_len
            );
            if opts.validate() {
                report.digests.push(report_digest(bundle.buffer()));
            }
        }
    }
    Ok(report)
}

/// Whether the worker received all the messages it was asked for
fn bound_reached(opts: &ServerOptions, report: &WorkerReport) -> bool {
    opts.max_messages().map_or(false, |max| report.messages >= max)
}

/// Run one worker thread per port and wait for all of them. Workers share
/// nothing, a failing worker ends alone.
pub fn run_multi_qp<V: Verbs>(
    verbs: &Arc<V>,
    opts: &ServerOptions,
    ports: &[u16],
) -> Vec<(u16, Result<WorkerReport, FlowError>)> {
    let handles: Vec<_> = ports
        .iter()
        .map(|&port| {
            let verbs = Arc::clone(verbs);
            let opts = opts.clone();
            let handle = thread::Builder::new()
                .name(format!("qp-worker-{port}"))
                .spawn(move || worker(&verbs, &opts, port));
            (port, handle)
        })
        .collect();

    handles
        .into_iter()
        .map(|(port, handle)| {
            let ret = match handle {
                Ok(handle) => handle.join().unwrap_or_else(|_| {
                    Err(FlowError::setup("worker thread")(io::Error::new(
                        io::ErrorKind::Other,
                        "worker panicked",
                    )))
                }),
                Err(e) => Err(FlowError::setup("spawn worker thread")(e)),
            };
            match ret {
                Ok(ref report) => info!(
                    "worker on port {} finished after {} message(s)",
                    port, report.messages
                ),
                Err(ref e) => error!("worker on port {} failed: {}", port, e),
            }
            (port, ret)
        })
        .collect()
}
