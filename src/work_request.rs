use rand::Rng;
use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

/// Work request id
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub struct WorkRequestId(u64);

impl WorkRequestId {
    /// Create a new id for `WorkRequest`.
    ///
    /// The sub-second part of the wall clock is concatenated with a random
    /// number so ids of consecutive requests do not collide.
    #[must_use]
    pub fn new() -> Self {
        // No time can be earlier than Unix Epoch
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since_the_epoch| since_the_epoch.subsec_micros());
        let rand = rand::thread_rng().gen::<u32>();
        let left: u64 = time.into();
        let right: u64 = rand.into();
        Self(left.wrapping_shl(32) | right)
    }
}

impl Default for WorkRequestId {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl From<WorkRequestId> for u64 {
    #[inline]
    fn from(wr_id: WorkRequestId) -> Self {
        wr_id.0
    }
}

impl From<u64> for WorkRequestId {
    #[inline]
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for WorkRequestId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scatter/gather element
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Sge {
    /// Start address of the registered buffer
    pub addr: u64,
    /// Number of bytes
    pub length: u32,
    /// Local key of the memory region
    pub lkey: u32,
}

/// Operation of a work request
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WrOpcode {
    /// Two-sided send, consumes a receive posted by the peer
    Send,
    /// Receive buffer for an incoming send
    Recv,
}

/// A single-element work request, either a signaled send or a receive
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WorkRequest {
    /// Id reported back in the completion
    pub wr_id: WorkRequestId,
    /// Send or receive
    pub opcode: WrOpcode,
    /// The one scatter/gather element
    pub sge: Sge,
}

impl WorkRequest {
    /// A signaled send of the whole `sge`
    #[must_use]
    pub fn new_send(sge: Sge) -> Self {
        Self {
            wr_id: WorkRequestId::new(),
            opcode: WrOpcode::Send,
            sge,
        }
    }

    /// A receive into the whole `sge`
    #[must_use]
    pub fn new_recv(sge: Sge) -> Self {
        Self {
            wr_id: WorkRequestId::new(),
            opcode: WrOpcode::Recv,
            sge,
        }
    }
}
