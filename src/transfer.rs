use crate::{
    completion_queue::{WcStatus, WorkCompletion},
    error::FlowError,
    resource::ResourceBundle,
    verbs::Verbs,
    work_request::{WorkRequest, WorkRequestId},
};
use std::{
    io,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// How to wait for a completion
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Spin on a non-blocking poll of the completion queue
    #[default]
    BusyPoll,
    /// Block on the completion channel between polls
    Notify,
}

/// Result of one completed work request
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WorkOutcome {
    /// Id of the work request
    pub wr_id: WorkRequestId,
    /// Completion status, always `Success` for a returned outcome
    pub status: WcStatus,
    /// Bytes transferred. For a receive this may be less than the buffer.
    pub byte_len: usize,
    /// Time from post to completion
    pub elapsed: Duration,
}

impl WorkOutcome {
    /// Elapsed time in milliseconds
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

/// Posts one work request over the whole registered buffer and waits for
/// its completion
#[derive(Debug)]
pub struct TransferEngine<'a, V: Verbs> {
    /// Resources of an established connection
    bundle: &'a ResourceBundle<V>,
    /// How completions are awaited
    strategy: WaitStrategy,
    /// Bound on each completion wait
    timeout: Option<Duration>,
}

impl<'a, V: Verbs> TransferEngine<'a, V> {
    /// Create an engine over `bundle`
    #[must_use]
    pub fn new(
        bundle: &'a ResourceBundle<V>,
        strategy: WaitStrategy,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            bundle,
            strategy,
            timeout,
        }
    }

    /// Send the whole buffer as one signaled SEND
    pub fn send(&self) -> Result<WorkOutcome, FlowError> {
        let wr = WorkRequest::new_send(self.bundle.sge());
        if self.strategy == WaitStrategy::Notify {
            self.arm()?;
        }
        let start = Instant::now();
        self.bundle
            .qp()
            .post_send(&wr)
            .map_err(FlowError::post("ibv_post_send"))?;
        let wc = self.wait(start)?;
        Self::outcome(wr.wr_id, wc, start)
    }

    /// Post a receive over the whole buffer and wait for one message
    pub fn receive(&self) -> Result<WorkOutcome, FlowError> {
        let wr = WorkRequest::new_recv(self.bundle.sge());
        let start = Instant::now();
        self.bundle
            .qp()
            .post_recv(&wr)
            .map_err(FlowError::post("ibv_post_recv"))?;
        self.arm()?;
        let wc = self.wait(start)?;
        Self::outcome(wr.wr_id, wc, start)
    }

    /// Request a notification for the next completion
    fn arm(&self) -> Result<(), FlowError> {
        self.bundle
            .cq()
            .req_notify(false)
            .map_err(FlowError::post("ibv_req_notify_cq"))
    }

    /// Wait until exactly one completion is returned
    fn wait(&self, start: Instant) -> Result<WorkCompletion, FlowError> {
        let cq = self.bundle.cq();
        loop {
            if let Some(wc) = cq.poll_one().map_err(FlowError::Poll)? {
                return Ok(wc);
            }
            let remaining = match self.timeout {
                Some(limit) => {
                    let left = limit.saturating_sub(start.elapsed());
                    if left.is_zero() {
                        return Err(FlowError::CompletionTimeout(limit));
                    }
                    Some(left)
                }
                None => None,
            };
            match self.strategy {
                WaitStrategy::BusyPoll => std::hint::spin_loop(),
                WaitStrategy::Notify => {
                    match cq.wait_notification(self.bundle.comp_channel(), remaining) {
                        Ok(()) => self.arm()?,
                        Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                            return Err(FlowError::CompletionTimeout(
                                self.timeout.unwrap_or_default(),
                            ));
                        }
                        Err(e) => return Err(FlowError::Poll(e)),
                    }
                }
            }
        }
    }

    /// Turn a completion into an outcome, failing on a non-success status
    fn outcome(
        posted: WorkRequestId,
        wc: WorkCompletion,
        start: Instant,
    ) -> Result<WorkOutcome, FlowError> {
        let elapsed = start.elapsed();
        if wc.wr_id() != posted {
            warn!("completion for wr_id {} while {} is outstanding", wc.wr_id(), posted);
        }
        match wc.result() {
            Ok(byte_len) => {
                debug!("wr_id {} completed, {} bytes in {:?}", posted, byte_len, elapsed);
                Ok(WorkOutcome {
                    wr_id: wc.wr_id(),
                    status: WcStatus::Success,
                    byte_len,
                    elapsed,
                })
            }
            Err(status) => Err(FlowError::Completion {
                wr_id: wc.wr_id(),
                status,
            }),
        }
    }
}
