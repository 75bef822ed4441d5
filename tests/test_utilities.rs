use portpicker::pick_unused_port;
use rdma_flow::{
    config::{ClientOptionsBuilder, ServerOptionsBuilder},
    sim::{Op, SimVerbs},
};
use std::{
    io::Write,
    net::{Ipv4Addr, SocketAddrV4},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tempfile::NamedTempFile;

/// How long a test waits for the server side to listen
#[allow(unused)]
pub(crate) const LISTEN_WAIT: Duration = Duration::from_secs(5);

/// Buffer size used where the size itself does not matter
#[allow(unused)]
pub(crate) const TEST_BUFFER_SIZE: usize = 4096;

#[allow(unused)]
pub(crate) fn get_unused_ipv4_addr() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, pick_unused_port().unwrap())
}

/// `n` distinct unused ports
#[allow(unused)]
pub(crate) fn get_unused_ports(n: usize) -> Vec<u16> {
    let mut ports: Vec<u16> = Vec::with_capacity(n);
    while ports.len() < n {
        let port = pick_unused_port().unwrap();
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    ports
}

/// A base port with `len` free consecutive ports after it
#[allow(unused)]
pub(crate) fn get_unused_port_range(len: u16) -> u16 {
    loop {
        let base = pick_unused_port().unwrap();
        if base.checked_add(len).is_some() {
            return base;
        }
    }
}

#[allow(unused)]
pub(crate) fn sim() -> Arc<SimVerbs> {
    Arc::new(SimVerbs::new())
}

#[allow(unused)]
pub(crate) fn localhost(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

/// Client options for one flow from a fresh source port to `dst`
#[allow(unused)]
pub(crate) fn client_options(dst: SocketAddrV4, buffer_size: usize) -> ClientOptionsBuilder {
    let mut builder = ClientOptionsBuilder::default();
    let _ = builder
        .dst(dst)
        .src(get_unused_ipv4_addr())
        .buffer_size(buffer_size);
    builder
}

#[allow(unused)]
pub(crate) fn server_options(buffer_size: usize) -> ServerOptionsBuilder {
    let mut builder = ServerOptionsBuilder::default();
    let _ = builder.buffer_size(buffer_size);
    builder
}

/// Run `f` on its own thread and wait until every address in `listening`
/// accepts connections
#[allow(unused)]
pub(crate) fn spawn_server<T, F>(
    verbs: &Arc<SimVerbs>,
    listening: &[SocketAddrV4],
    f: F,
) -> JoinHandle<T>
where
    T: Send + 'static,
    F: FnOnce(Arc<SimVerbs>) -> T + Send + 'static,
{
    let server = {
        let verbs = Arc::clone(verbs);
        thread::spawn(move || f(verbs))
    };
    for addr in listening {
        assert!(
            verbs.wait_for_listener(*addr, LISTEN_WAIT),
            "nobody listens on {addr}"
        );
    }
    server
}

/// A flow file holding `flows` as `(dst, src, size)`
#[allow(unused)]
pub(crate) fn flow_file(flows: &[(SocketAddrV4, SocketAddrV4, usize)]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{}", flows.len()).unwrap();
    for (dst, src, size) in flows {
        writeln!(
            file,
            "{} {} {} {} {}",
            dst.ip(),
            src.ip(),
            src.port(),
            dst.port(),
            size
        )
        .unwrap();
    }
    file.flush().unwrap();
    file
}

/// Block until `listens` listen calls succeeded, then until `addr` accepts
/// connections. Used when a server listens on the same address again.
#[allow(unused)]
pub(crate) fn wait_for_relisten(verbs: &SimVerbs, addr: SocketAddrV4, listens: usize) {
    let deadline = Instant::now() + LISTEN_WAIT;
    while verbs
        .journal()
        .iter()
        .filter(|c| c.op == Op::Listen && c.ok)
        .count()
        < listens
    {
        assert!(Instant::now() < deadline, "no listen number {listens}");
        thread::sleep(Duration::from_millis(1));
    }
    assert!(verbs.wait_for_listener(addr, LISTEN_WAIT));
}

/// The operations journaled since `from`
#[allow(unused)]
pub(crate) fn ops_since(verbs: &SimVerbs, from: usize) -> Vec<Op> {
    verbs.journal()[from..].iter().map(|c| c.op).collect()
}

/// Every retrieved cm event was acknowledged exactly once
#[allow(unused)]
pub(crate) fn assert_events_acked(verbs: &SimVerbs) {
    let journal = verbs.journal();
    let got = journal
        .iter()
        .filter(|c| c.op == Op::GetCmEvent && c.ok)
        .count();
    let acked = journal
        .iter()
        .filter(|c| c.op == Op::AckCmEvent && c.ok)
        .count();
    assert_eq!(got, acked, "retrieved {got} events, acknowledged {acked}");
    assert_eq!(verbs.unacked_events(), 0);
}
