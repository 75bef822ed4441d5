use crate::{
    cq_event_channel::CompChannel,
    error_utilities::{log_release, log_ret},
    verbs::Verbs,
    work_request::WorkRequestId,
};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::{fmt::Debug, io, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::error;

/// Completion queue entries, enough for one outstanding request per flow
pub const DEFAULT_CQ_SIZE: i32 = 10_i32;

/// Complete Queue Structure
#[derive(Debug)]
pub struct CompletionQueue<V: Verbs> {
    /// Backend that created the cq
    verbs: Arc<V>,
    /// Real Completion Queue
    inner_cq: V::Cq,
}

impl<V: Verbs> CompletionQueue<V> {
    /// Create a new completion queue on the device of `id` and bind it to the
    /// completion channel `cc`, `cq_size` is the number of entries
    pub(crate) fn create(
        verbs: &Arc<V>,
        id: V::CmId,
        cq_size: i32,
        cc: &CompChannel<V>,
    ) -> io::Result<Self> {
        let inner_cq = log_ret(verbs.create_cq(id, cq_size, cc.raw()), "ibv_create_cq")?;
        Ok(Self {
            verbs: Arc::clone(verbs),
            inner_cq,
        })
    }

    /// The backend handle
    pub(crate) fn raw(&self) -> V::Cq {
        self.inner_cq
    }

    /// Request notification on next complete event arrive
    pub(crate) fn req_notify(&self, solicited_only: bool) -> io::Result<()> {
        log_ret(
            self.verbs.req_notify_cq(self.inner_cq, solicited_only),
            "ibv_req_notify_cq",
        )
    }

    /// Poll at most one work completion. `Ok(None)` means try again.
    pub(crate) fn poll_one(&self) -> io::Result<Option<WorkCompletion>> {
        let mut wc = WorkCompletion::default();
        match self.verbs.poll_cq(self.inner_cq, &mut wc)? {
            0 => Ok(None),
            _ => Ok(Some(wc)),
        }
    }

    /// Block on the completion channel until this cq raises a notification,
    /// then acknowledge it
    pub(crate) fn wait_notification(
        &self,
        cc: &CompChannel<V>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let cq = self.verbs.get_cq_event(cc.raw(), timeout)?;
        let verbs = Arc::clone(&self.verbs);
        // every channel event is acked, also when it belongs to another cq
        let _ack = scopeguard::guard(cq, move |cq| verbs.ack_cq_events(cq, 1));
        if cq != self.inner_cq {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "completion channel signaled a foreign cq",
            ));
        }
        Ok(())
    }
}

impl<V: Verbs> Drop for CompletionQueue<V> {
    fn drop(&mut self) {
        log_release(self.verbs.destroy_cq(self.inner_cq), "completion queue");
    }
}

/// Work Completion
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkCompletion {
    /// Id of the completed work request
    pub wr_id: u64,
    /// Raw `ibv_wc_status`
    pub status: u32,
    /// Bytes transferred, meaningful for receives
    pub byte_len: u32,
}

impl WorkCompletion {
    /// Get work request Id
    #[must_use]
    pub fn wr_id(&self) -> WorkRequestId {
        WorkRequestId::from(self.wr_id)
    }

    /// Decoded completion status
    #[must_use]
    pub fn status(&self) -> WcStatus {
        WcStatus::from_u32(self.status).unwrap_or(WcStatus::UnexpectedErr)
    }

    /// Get work completion result.
    /// Returns the length on success otherwise returns an error.
    pub fn result(&self) -> Result<usize, WcStatus> {
        match self.status() {
            WcStatus::Success => Ok(usize::try_from(self.byte_len).unwrap_or(usize::MAX)),
            status => {
                error!("error wc wrid : {}", self.wr_id);
                Err(status)
            }
        }
    }
}

/// Work completion status
#[allow(missing_docs)]
#[derive(Error, Debug, FromPrimitive, Copy, Clone, PartialEq, Eq)]
pub enum WcStatus {
    #[error("Success")]
    Success = 0,
    #[error("Local Length Error: a posted receive buffer is not big enough for the incoming message, or an outgoing message is bigger than the port supports.")]
    LocLenErr = 1,
    #[error("Local QP Operation Error: an internal QP consistency error was detected while processing this Work Request.")]
    LocQpOpErr = 2,
    #[error("Local EE Context Operation Error.")]
    LocEecOpErr = 3,
    #[error("Local Protection Error: the scatter/gather list does not reference a Memory Region valid for the requested operation.")]
    LocProtErr = 4,
    #[error("Work Request Flushed Error: the Work Request was outstanding when the QP transitioned into the Error State.")]
    WrFlushErr = 5,
    #[error("Memory Window Binding Error.")]
    MwBindErr = 6,
    #[error("Bad Response Error: an unexpected transport layer opcode was returned by the responder.")]
    BadRespErr = 7,
    #[error("Local Access Error: a protection error occurred on a local data buffer.")]
    LocAccessErr = 8,
    #[error("Remote Invalid Request Error: the responder detected an invalid message on the channel, e.g. its receive buffer is too small.")]
    RemInvReqErr = 9,
    #[error("Remote Access Error: a protection error occurred on a remote data buffer.")]
    RemAccessErr = 10,
    #[error("Remote Operation Error: the operation could not be completed successfully by the responder.")]
    RemOpErr = 11,
    #[error("Transport Retry Counter Exceeded: the remote side didn't send any Ack or Nack.")]
    RetryExc = 12,
    #[error("RNR Retry Counter Exceeded: the remote side didn't post any WR to its Receive Queue.")]
    RnrRetryExc = 13,
    #[error("Local RDD Violation Error.")]
    LocRddViolErr = 14,
    #[error("Remote Invalid RD Request.")]
    RemInvRdReq = 15,
    #[error("Remote Aborted Error.")]
    RemAbortErr = 16,
    #[error("Invalid EE Context Number.")]
    InvEecn = 17,
    #[error("Invalid EE Context State Error.")]
    InvEecState = 18,
    #[error("Fatal Error.")]
    Fatal = 19,
    #[error("Response Timeout Error.")]
    RespTimeout = 20,
    #[error("General Error: other error which isn't one of the above errors.")]
    GeneralErr = 21,
    #[error("Unexpected Error.")]
    UnexpectedErr = 100,
}

impl WcStatus {
    /// The raw `ibv_wc_status` value
    #[inline]
    #[must_use]
    #[allow(clippy::as_conversions)]
    pub const fn code(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_reports_length() {
        let wc = WorkCompletion {
            wr_id: 42,
            status: 0,
            byte_len: 17,
        };
        assert_eq!(wc.result(), Ok(17));
        assert_eq!(u64::from(wc.wr_id()), 42);
    }

    #[test]
    fn failure_decodes_status() {
        let wc = WorkCompletion {
            wr_id: 1,
            status: 13,
            byte_len: 0,
        };
        assert_eq!(wc.result(), Err(WcStatus::RnrRetryExc));
        assert_eq!(WcStatus::RnrRetryExc.code(), 13);
        let unknown = WorkCompletion {
            status: 77,
            ..wc
        };
        assert_eq!(unknown.status(), WcStatus::UnexpectedErr);
    }
}
