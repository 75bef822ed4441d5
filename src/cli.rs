//! Command line of the `rdma-flow` binary.

use crate::{
    config::{
        ClientOptions, ClientOptionsBuilder, ClientOptionsBuilderError, ServerOptions,
        ServerOptionsBuilder, ServerOptionsBuilderError, Timeouts, DEFAULT_BUFFER_SIZE,
        DEFAULT_DST_PORT, DEFAULT_SRC_PORT, DEFAULT_SWEEP_LEN,
    },
    transfer::WaitStrategy,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    path::PathBuf,
    time::Duration,
};

/// Single-payload RDMA transfers over rdma_cm
#[derive(Parser, Debug)]
#[command(name = "rdma-flow", version)]
pub struct Cli {
    /// Side to run
    #[command(subcommand)]
    pub command: Command,
}

/// The two sides of a flow
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect to a server and send one buffer per flow
    Client(ClientArgs),
    /// Accept connections and receive one buffer per connection
    Server(ServerArgs),
}

/// Completion wait strategy
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitArg {
    /// Spin on the completion queue
    BusyPoll,
    /// Sleep on the completion channel
    Notify,
}

impl From<WaitArg> for WaitStrategy {
    fn from(arg: WaitArg) -> Self {
        match arg {
            WaitArg::BusyPoll => Self::BusyPoll,
            WaitArg::Notify => Self::Notify,
        }
    }
}

/// Wait bounds and strategy shared by both sides
#[derive(Args, Debug, Clone)]
pub struct WaitArgs {
    /// Address and route resolution timeout in milliseconds
    #[arg(long, default_value = "2000")]
    pub resolve_timeout_ms: u64,

    /// Bound on waiting for a connect request or the established event
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Bound on waiting for a completion
    #[arg(long)]
    pub completion_timeout_ms: Option<u64>,

    /// How completions are awaited
    #[arg(long, value_enum, default_value = "busy-poll")]
    pub wait: WaitArg,
}

impl WaitArgs {
    /// The wait bounds
    #[must_use]
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            resolve: Duration::from_millis(self.resolve_timeout_ms),
            establish: self.connect_timeout_ms.map(Duration::from_millis),
            completion: self.completion_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Client options
#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Destination port
    #[arg(short = 'd', long, default_value_t = DEFAULT_DST_PORT)]
    pub dst_port: u16,

    /// Buffer size in bytes
    #[arg(short = 's', long, default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Source port
    #[arg(short = 'p', long, default_value_t = DEFAULT_SRC_PORT)]
    pub src_port: u16,

    /// Source ip
    #[arg(short = 'i', long, default_value_t = Ipv4Addr::LOCALHOST)]
    pub src_ip: Ipv4Addr,

    /// Remote (server) ip
    #[arg(short = 'r', long, default_value_t = Ipv4Addr::LOCALHOST)]
    pub remote_ip: Ipv4Addr,

    /// Print the digest of the buffer
    #[arg(short = 'v', long)]
    pub validate: bool,

    /// Fill the buffer with random bytes
    #[arg(short = 'f', long)]
    pub fill: bool,

    /// Flow file, one flow per line
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Send again for every line read from stdin
    #[arg(long)]
    pub interactive: bool,

    /// Start each flow of the flow file at its timestamp
    #[arg(long)]
    pub honor_timestamps: bool,

    /// Wait bounds and strategy
    #[command(flatten)]
    pub wait: WaitArgs,
}

impl ClientArgs {
    /// Build the validated client options
    pub fn into_options(self) -> Result<ClientOptions, ClientOptionsBuilderError> {
        let mut builder = ClientOptionsBuilder::default();
        let _ = builder
            .dst(SocketAddrV4::new(self.remote_ip, self.dst_port))
            .src(SocketAddrV4::new(self.src_ip, self.src_port))
            .buffer_size(self.buffer_size)
            .validate(self.validate)
            .fill(self.fill)
            .interactive(self.interactive)
            .honor_timestamps(self.honor_timestamps)
            .timeouts(self.wait.timeouts())
            .wait(self.wait.wait.into());
        if let Some(path) = self.config {
            let _ = builder.flows_file(path);
        }
        builder.build()
    }
}

/// Server options
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Base port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Comma separated port per queue pair, excludes `--port`
    #[arg(long, value_delimiter = ',')]
    pub ports: Option<Vec<u16>>,

    /// Buffer size in bytes
    #[arg(short = 's', long, default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Ip to listen on
    #[arg(short = 'i', long, default_value_t = Ipv4Addr::LOCALHOST)]
    pub ip: Ipv4Addr,

    /// Print the digest of every received buffer
    #[arg(short = 'v', long)]
    pub validate: bool,

    /// Queue pairs, one worker thread each
    #[arg(short = 'q', long)]
    pub qps: Option<usize>,

    /// Ports served one after the other without `--qps`
    #[arg(long, default_value_t = DEFAULT_SWEEP_LEN)]
    pub sweep: usize,

    /// Messages each worker receives before it stops
    #[arg(long)]
    pub max_messages: Option<u64>,

    /// Wait bounds and strategy
    #[command(flatten)]
    pub wait: WaitArgs,
}

impl ServerArgs {
    /// Build the server options. Port validation happens in
    /// [`ServerOptions::plan`].
    pub fn into_options(self) -> Result<ServerOptions, ServerOptionsBuilderError> {
        let mut builder = ServerOptionsBuilder::default();
        let _ = builder
            .ip(self.ip)
            .buffer_size(self.buffer_size)
            .validate(self.validate)
            .sweep_len(self.sweep)
            .timeouts(self.wait.timeouts())
            .wait(self.wait.wait.into());
        if let Some(port) = self.port {
            let _ = builder.port(port);
        }
        if let Some(ports) = self.ports {
            let _ = builder.ports(ports);
        }
        if let Some(qps) = self.qps {
            let _ = builder.qps(qps);
        }
        if let Some(max) = self.max_messages {
            let _ = builder.max_messages(max);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ServerPlan, error::ConfigError};

    #[test]
    fn client_flags() {
        let cli = Cli::try_parse_from([
            "rdma-flow", "client", "-d", "23458", "-s", "1024", "-p", "12345", "-i",
            "192.168.9.2", "-r", "192.168.3.2", "-v", "--wait", "notify",
        ])
        .unwrap();
        let Command::Client(args) = cli.command else {
            panic!("expected client");
        };
        let opts = args.into_options().unwrap();
        assert_eq!(opts.dst(), "192.168.3.2:23458".parse().unwrap());
        assert_eq!(opts.src(), "192.168.9.2:12345".parse().unwrap());
        assert_eq!(opts.buffer_size(), 1024);
        assert!(opts.validate());
        assert!(!opts.fill());
        assert_eq!(opts.wait(), WaitStrategy::Notify);
        assert_eq!(opts.timeouts(), Timeouts::default());
    }

    #[test]
    fn server_port_list() {
        let cli = Cli::try_parse_from([
            "rdma-flow",
            "server",
            "--ports",
            "20000,20001,20002",
            "-q",
            "3",
            "--connect-timeout-ms",
            "50",
        ])
        .unwrap();
        let Command::Server(args) = cli.command else {
            panic!("expected server");
        };
        let opts = args.into_options().unwrap();
        assert_eq!(
            opts.plan().unwrap(),
            ServerPlan::MultiQp {
                ports: vec![20000, 20001, 20002]
            }
        );
        assert_eq!(opts.timeouts().establish, Some(Duration::from_millis(50)));
    }

    #[test]
    fn server_port_and_list_conflict_in_plan() {
        let cli =
            Cli::try_parse_from(["rdma-flow", "server", "-p", "20000", "--ports", "20000"])
                .unwrap();
        let Command::Server(args) = cli.command else {
            panic!("expected server");
        };
        let opts = args.into_options().unwrap();
        assert!(matches!(opts.plan(), Err(ConfigError::ConflictingPorts)));
    }
}
