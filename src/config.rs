//! Flow descriptors, the flow file format and the validated option sets of
//! the client and the server.
//!
//! A flow file starts with the number of flows `N`, followed by `N` lines of
//! whitespace separated tokens:
//!
//! ```text
//! <dst_ip> <src_ip> <src_port> <dst_port> <buffer_size> [<unix_timestamp_seconds>]
//! ```

use crate::{error::ConfigError, transfer::WaitStrategy};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use std::{
    fs,
    net::{Ipv4Addr, SocketAddrV4},
    path::{Path, PathBuf},
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Port the server listens on and the client connects to
pub const DEFAULT_DST_PORT: u16 = 23456;
/// Port the client binds to
pub const DEFAULT_SRC_PORT: u16 = 12345;
/// Registered buffer size, 100 MiB
pub const DEFAULT_BUFFER_SIZE: usize = 100 * 1024 * 1024;
/// Number of consecutive ports the sequential server serves
pub const DEFAULT_SWEEP_LEN: usize = 10;
/// Bound of address and route resolution
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Bounds of the blocking waits of a flow. `None` waits forever.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Address and route resolution
    pub resolve: Duration,
    /// Every wait for `CONNECT_REQUEST` and `ESTABLISHED`
    pub establish: Option<Duration>,
    /// Every completion queue wait
    pub completion: Option<Duration>,
}

impl Default for Timeouts {
    #[inline]
    fn default() -> Self {
        Self {
            resolve: DEFAULT_RESOLVE_TIMEOUT,
            establish: None,
            completion: None,
        }
    }
}

/// Parameters of one client flow
#[derive(Copy, Clone, Debug, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct FlowDescriptor {
    /// Server address
    dst: SocketAddrV4,
    /// Local address the connection is bound to
    src: SocketAddrV4,
    /// Bytes to send
    buffer_size: usize,
    /// Unix time in seconds the flow is scheduled for
    timestamp: Option<u64>,
}

impl FlowDescriptor {
    /// A flow without a schedule
    #[must_use]
    pub fn new(dst: SocketAddrV4, src: SocketAddrV4, buffer_size: usize) -> Self {
        Self {
            dst,
            src,
            buffer_size,
            timestamp: None,
        }
    }

    /// The same flow scheduled at `timestamp`
    #[must_use]
    pub fn with_timestamp(self, timestamp: u64) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..self
        }
    }

    /// How long to wait until the scheduled start, zero when it already passed
    #[must_use]
    pub fn delay_from(&self, now: SystemTime) -> Duration {
        self.timestamp.map_or(Duration::ZERO, |ts| {
            let start = UNIX_EPOCH + Duration::from_secs(ts);
            start.duration_since(now).unwrap_or(Duration::ZERO)
        })
    }
}

/// Parse one token of line `line`
fn token<T: FromStr>(raw: &str, what: &str, line: usize) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Malformed {
        line,
        reason: format!("invalid {what} `{raw}`"),
    })
}

/// Parse the text of a flow file
pub fn parse_flow_file(text: &str) -> Result<Vec<FlowDescriptor>, ConfigError> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i.saturating_add(1), l.trim()))
        .filter(|&(_, l)| !l.is_empty());

    let expected = match lines.next() {
        Some((line, raw)) => token::<usize>(raw, "flow count", line)?,
        None => {
            return Err(ConfigError::Malformed {
                line: 1,
                reason: "missing flow count".to_owned(),
            })
        }
    };

    let mut flows = Vec::with_capacity(expected);
    for (line, raw) in lines.take(expected) {
        let fields: Vec<&str> = raw.split_whitespace().collect();
        let (dst_ip, src_ip, src_port, dst_port, size, ts) = match fields.as_slice() {
            [d, s, sp, dp, sz] => (*d, *s, *sp, *dp, *sz, None),
            [d, s, sp, dp, sz, ts] => (*d, *s, *sp, *dp, *sz, Some(*ts)),
            _ => {
                return Err(ConfigError::Malformed {
                    line,
                    reason: format!("expected 5 or 6 fields, found {}", fields.len()),
                })
            }
        };
        let dst = SocketAddrV4::new(
            token::<Ipv4Addr>(dst_ip, "destination ip", line)?,
            token::<u16>(dst_port, "destination port", line)?,
        );
        let src = SocketAddrV4::new(
            token::<Ipv4Addr>(src_ip, "source ip", line)?,
            token::<u16>(src_port, "source port", line)?,
        );
        let buffer_size = token::<usize>(size, "buffer size", line)?;
        if buffer_size == 0 {
            return Err(ConfigError::Malformed {
                line,
                reason: "buffer size must be at least 1 byte".to_owned(),
            });
        }
        let mut flow = FlowDescriptor::new(dst, src, buffer_size);
        if let Some(ts) = ts {
            flow = flow.with_timestamp(token::<u64>(ts, "timestamp", line)?);
        }
        flows.push(flow);
    }

    if flows.len() < expected {
        return Err(ConfigError::MissingFlows {
            expected,
            found: flows.len(),
        });
    }
    Ok(flows)
}

/// Read and parse a flow file
pub fn read_flow_file(path: &Path) -> Result<Vec<FlowDescriptor>, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    parse_flow_file(&text)
}

/// Everything the client needs to run
#[derive(Clone, Debug, Builder, Getters, CopyGetters)]
#[builder(derive(Debug))]
pub struct ClientOptions {
    /// Server address
    #[builder(default = "SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_DST_PORT)")]
    #[getset(get_copy = "pub")]
    dst: SocketAddrV4,
    /// Local address
    #[builder(default = "SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_SRC_PORT)")]
    #[getset(get_copy = "pub")]
    src: SocketAddrV4,
    /// Bytes to send
    #[builder(default = "DEFAULT_BUFFER_SIZE")]
    #[getset(get_copy = "pub")]
    buffer_size: usize,
    /// Print the digest of the buffer before sending
    #[builder(default)]
    #[getset(get_copy = "pub")]
    validate: bool,
    /// Send random bytes instead of the greeting
    #[builder(default)]
    #[getset(get_copy = "pub")]
    fill: bool,
    /// Send again for every line read from stdin
    #[builder(default)]
    #[getset(get_copy = "pub")]
    interactive: bool,
    /// Delay each flow until its timestamp
    #[builder(default)]
    #[getset(get_copy = "pub")]
    honor_timestamps: bool,
    /// Flow file replacing `dst`, `src` and `buffer_size`
    #[builder(default, setter(strip_option))]
    #[getset(get = "pub")]
    flows_file: Option<PathBuf>,
    /// Wait bounds
    #[builder(default)]
    #[getset(get_copy = "pub")]
    timeouts: Timeouts,
    /// Completion wait strategy
    #[builder(default)]
    #[getset(get_copy = "pub")]
    wait: WaitStrategy,
}

impl ClientOptions {
    /// The flows to run, in order
    pub fn flows(&self) -> Result<Vec<FlowDescriptor>, ConfigError> {
        match self.flows_file {
            Some(ref path) => read_flow_file(path),
            None if self.buffer_size == 0 => Err(ConfigError::EmptyBuffer),
            None => Ok(vec![FlowDescriptor::new(
                self.dst,
                self.src,
                self.buffer_size,
            )]),
        }
    }
}

/// How the server serves its ports
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerPlan {
    /// One connection per port, `count` consecutive ports from `base`, one
    /// after the other
    Sweep {
        /// First port
        base: u16,
        /// Number of ports
        count: usize,
    },
    /// One worker thread per port, all at once
    MultiQp {
        /// One port per worker
        ports: Vec<u16>,
    },
}

/// Everything the server needs to run
#[derive(Clone, Debug, Builder, Getters, CopyGetters)]
#[builder(derive(Debug))]
pub struct ServerOptions {
    /// Address to listen on
    #[builder(default = "Ipv4Addr::LOCALHOST")]
    #[getset(get_copy = "pub")]
    ip: Ipv4Addr,
    /// Base port
    #[builder(default, setter(strip_option))]
    #[getset(get_copy = "pub")]
    port: Option<u16>,
    /// Explicit port per worker
    #[builder(default, setter(strip_option))]
    #[getset(get = "pub")]
    ports: Option<Vec<u16>>,
    /// Bytes to receive
    #[builder(default = "DEFAULT_BUFFER_SIZE")]
    #[getset(get_copy = "pub")]
    buffer_size: usize,
    /// Print the digest of every received buffer
    #[builder(default)]
    #[getset(get_copy = "pub")]
    validate: bool,
    /// Worker count, selects the concurrent mode
    #[builder(default, setter(strip_option))]
    #[getset(get_copy = "pub")]
    qps: Option<usize>,
    /// Ports served by the sequential mode
    #[builder(default = "DEFAULT_SWEEP_LEN")]
    #[getset(get_copy = "pub")]
    sweep_len: usize,
    /// Messages each worker receives before it ends
    #[builder(default, setter(strip_option))]
    #[getset(get_copy = "pub")]
    max_messages: Option<u64>,
    /// Wait bounds
    #[builder(default)]
    #[getset(get_copy = "pub")]
    timeouts: Timeouts,
    /// Completion wait strategy
    #[builder(default)]
    #[getset(get_copy = "pub")]
    wait: WaitStrategy,
}

impl ServerOptions {
    /// Validate the options and decide how the ports are served.
    ///
    /// A port list or a worker count selects the concurrent mode, otherwise
    /// the ports are swept sequentially.
    pub fn plan(&self) -> Result<ServerPlan, ConfigError> {
        if self.port.is_some() && self.ports.is_some() {
            return Err(ConfigError::ConflictingPorts);
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::EmptyBuffer);
        }
        let base = self.port.unwrap_or(DEFAULT_DST_PORT);
        match (self.qps, &self.ports) {
            (Some(0), _) => Err(ConfigError::InvalidQpCount),
            (Some(qps), Some(ports)) if ports.len() != qps => Err(ConfigError::PortCountMismatch {
                ports: ports.len(),
                qps,
            }),
            (_, Some(ports)) if ports.is_empty() => Err(ConfigError::InvalidQpCount),
            (_, Some(ports)) => Ok(ServerPlan::MultiQp {
                ports: ports.clone(),
            }),
            (Some(qps), None) => Ok(ServerPlan::MultiQp {
                ports: port_range(base, qps)?,
            }),
            (None, None) => {
                // every swept port must exist
                let _ = port_range(base, self.sweep_len)?;
                Ok(ServerPlan::Sweep {
                    base,
                    count: self.sweep_len,
                })
            }
        }
    }
}

/// `count` consecutive ports starting at `base`
fn port_range(base: u16, count: usize) -> Result<Vec<u16>, ConfigError> {
    (0..count)
        .map(|offset| {
            u16::try_from(offset)
                .ok()
                .and_then(|o| base.checked_add(o))
                .ok_or(ConfigError::PortOverflow { base, offset })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flows_in_order() {
        let text = "2\n\
                    10.0.0.2 10.0.0.1 12345 23456 1024 1700000000\n\
                    \n\
                    10.0.0.3 10.0.0.1 12346 23457 2048\n";
        let flows = parse_flow_file(text).unwrap();
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].dst(), "10.0.0.2:23456".parse().unwrap());
        assert_eq!(flows[0].src(), "10.0.0.1:12345".parse().unwrap());
        assert_eq!(flows[0].buffer_size(), 1024);
        assert_eq!(flows[0].timestamp(), Some(1_700_000_000));
        assert_eq!(flows[1].dst().port(), 23457);
        assert_eq!(flows[1].timestamp(), None);
    }

    #[test]
    fn extra_lines_are_ignored() {
        let text = "1\n10.0.0.2 10.0.0.1 1 2 3\n10.0.0.9 10.0.0.1 1 2 3\n";
        assert_eq!(parse_flow_file(text).unwrap().len(), 1);
    }

    #[test]
    fn rejects_malformed_files() {
        assert!(matches!(
            parse_flow_file(""),
            Err(ConfigError::Malformed { line: 1, .. })
        ));
        assert!(matches!(
            parse_flow_file("two\n"),
            Err(ConfigError::Malformed { line: 1, .. })
        ));
        assert!(matches!(
            parse_flow_file("3\n10.0.0.2 10.0.0.1 1 2 3\n"),
            Err(ConfigError::MissingFlows {
                expected: 3,
                found: 1
            })
        ));
        assert!(matches!(
            parse_flow_file("1\n10.0.0.2 10.0.0.1 1 2\n"),
            Err(ConfigError::Malformed { line: 2, .. })
        ));
        assert!(matches!(
            parse_flow_file("1\n10.0.0.256 10.0.0.1 1 2 3\n"),
            Err(ConfigError::Malformed { line: 2, .. })
        ));
        assert!(matches!(
            parse_flow_file("1\n10.0.0.2 10.0.0.1 1 70000 3\n"),
            Err(ConfigError::Malformed { line: 2, .. })
        ));
        assert!(matches!(
            parse_flow_file("1\n10.0.0.2 10.0.0.1 1 2 0\n"),
            Err(ConfigError::Malformed { line: 2, .. })
        ));
    }

    #[test]
    fn delay_until_timestamp() {
        let flow = FlowDescriptor::new(
            "10.0.0.2:1".parse().unwrap(),
            "10.0.0.1:2".parse().unwrap(),
            8,
        );
        let now = UNIX_EPOCH + Duration::from_secs(100);
        assert_eq!(flow.delay_from(now), Duration::ZERO);
        assert_eq!(
            flow.with_timestamp(103).delay_from(now),
            Duration::from_secs(3)
        );
        assert_eq!(flow.with_timestamp(50).delay_from(now), Duration::ZERO);
    }

    #[test]
    fn default_plan_is_a_sweep_of_ten() {
        let opts = ServerOptionsBuilder::default().build().unwrap();
        assert_eq!(
            opts.plan().unwrap(),
            ServerPlan::Sweep {
                base: DEFAULT_DST_PORT,
                count: DEFAULT_SWEEP_LEN
            }
        );
        assert_eq!(opts.timeouts(), Timeouts::default());
    }

    #[test]
    fn worker_count_offsets_the_base_port() {
        let opts = ServerOptionsBuilder::default()
            .port(30000)
            .qps(3)
            .build()
            .unwrap();
        assert_eq!(
            opts.plan().unwrap(),
            ServerPlan::MultiQp {
                ports: vec![30000, 30001, 30002]
            }
        );
    }

    #[test]
    fn invalid_server_plans() {
        let both = ServerOptionsBuilder::default()
            .port(20000)
            .ports(vec![20000])
            .build()
            .unwrap();
        assert!(matches!(both.plan(), Err(ConfigError::ConflictingPorts)));

        let mismatch = ServerOptionsBuilder::default()
            .ports(vec![20000, 20001])
            .qps(3)
            .build()
            .unwrap();
        assert!(matches!(
            mismatch.plan(),
            Err(ConfigError::PortCountMismatch { ports: 2, qps: 3 })
        ));

        let zero = ServerOptionsBuilder::default().qps(0).build().unwrap();
        assert!(matches!(zero.plan(), Err(ConfigError::InvalidQpCount)));

        let overflow = ServerOptionsBuilder::default()
            .port(65534)
            .qps(3)
            .build()
            .unwrap();
        assert!(matches!(
            overflow.plan(),
            Err(ConfigError::PortOverflow {
                base: 65534,
                offset: 2
            })
        ));
    }

    #[test]
    fn single_flow_without_file() {
        let opts = ClientOptionsBuilder::default()
            .buffer_size(64)
            .build()
            .unwrap();
        let flows = opts.flows().unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].dst().port(), DEFAULT_DST_PORT);
        assert_eq!(flows[0].src().port(), DEFAULT_SRC_PORT);

        let empty = ClientOptionsBuilder::default()
            .buffer_size(0)
            .build()
            .unwrap();
        assert!(matches!(empty.flows(), Err(ConfigError::EmptyBuffer)));
    }
}
