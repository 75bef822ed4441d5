use crate::{completion_queue::WcStatus, verbs::CmEventKind, work_request::WorkRequestId};
use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;

/// Error category of a failed flow
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Resource allocation or registration failed
    Setup,
    /// Address/route resolution, connect or accept failed
    Handshake,
    /// Posting or completing the transfer failed
    Transfer,
    /// Invalid options or configuration file
    Configuration,
}

/// Everything that can end a flow
#[derive(Debug, Error)]
pub enum FlowError {
    /// Allocation of a resource failed
    #[error("{step} failed: {source}")]
    Setup {
        /// The verb that failed
        step: &'static str,
        /// OS error reported by the verb
        #[source]
        source: io::Error,
    },
    /// A handshake call failed or its wait timed out
    #[error("{step} failed: {source}")]
    Handshake {
        /// The call or wait that failed
        step: &'static str,
        /// OS error reported by the call
        #[source]
        source: io::Error,
    },
    /// A CM event other than the awaited one arrived
    #[error("unexpected event {observed} with status {status}, expected {expected}")]
    UnexpectedEvent {
        /// The event the handshake waited for
        expected: CmEventKind,
        /// The event that arrived
        observed: CmEventKind,
        /// Status carried by the event
        status: i32,
    },
    /// The handshake was driven from a state that does not wait for events
    #[error("no CM event is awaited in handshake state {0}")]
    InvalidState(&'static str),
    /// Posting a work request failed
    #[error("{step} failed: {source}")]
    Post {
        /// `ibv_post_send` or `ibv_post_recv`
        step: &'static str,
        /// OS error reported by the post
        #[source]
        source: io::Error,
    },
    /// A completion reported a non-success status
    #[error("failed status {status} ({code}) for wr_id {wr_id}", code = .status.code())]
    Completion {
        /// Id of the failed work request
        wr_id: WorkRequestId,
        /// Status of the completion
        status: WcStatus,
    },
    /// Polling the completion queue failed
    #[error("ibv_poll_cq failed: {0}")]
    Poll(#[source] io::Error),
    /// The bounded completion wait elapsed
    #[error("no completion within {0:?}")]
    CompletionTimeout(Duration),
    /// Options or configuration file are invalid
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl FlowError {
    /// The error category
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Setup { .. } => ErrorKind::Setup,
            Self::Handshake { .. } | Self::UnexpectedEvent { .. } | Self::InvalidState(_) => {
                ErrorKind::Handshake
            }
            Self::Post { .. }
            | Self::Completion { .. }
            | Self::Poll(_)
            | Self::CompletionTimeout(_) => ErrorKind::Transfer,
            Self::Config(_) => ErrorKind::Configuration,
        }
    }

    /// A setup failure of `step`
    pub(crate) fn setup(step: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Setup { step, source }
    }

    /// A handshake failure of `step`
    pub(crate) fn handshake(step: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Handshake { step, source }
    }

    /// A post failure of `step`
    pub(crate) fn post(step: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Post { step, source }
    }
}

/// Invalid options or configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("can not read {path}: {source}")]
    Unreadable {
        /// Path of the file
        path: PathBuf,
        /// Read error
        #[source]
        source: io::Error,
    },
    /// A line of the configuration file is malformed
    #[error("line {line}: {reason}")]
    Malformed {
        /// 1-based line number
        line: usize,
        /// What is wrong
        reason: String,
    },
    /// The file announces more flows than it contains
    #[error("expected {expected} flows, found {found}")]
    MissingFlows {
        /// Flow count from the first line
        expected: usize,
        /// Flow lines present
        found: usize,
    },
    /// A base port and a port list were both supplied
    #[error("a base port and a port list are mutually exclusive")]
    ConflictingPorts,
    /// The port list does not have one port per queue pair
    #[error("{ports} ports given for {qps} queue pairs")]
    PortCountMismatch {
        /// Length of the port list
        ports: usize,
        /// Requested queue-pair count
        qps: usize,
    },
    /// Zero queue pairs requested
    #[error("queue-pair count must be at least 1")]
    InvalidQpCount,
    /// Base port plus offset leaves the port range
    #[error("port {base} + {offset} is out of range")]
    PortOverflow {
        /// Base port
        base: u16,
        /// Offset added to it
        offset: usize,
    },
    /// Buffer size of zero
    #[error("buffer size must be at least 1 byte")]
    EmptyBuffer,
}
