use crate::{
    completion_queue::CompletionQueue,
    error_utilities::{log_release, log_ret},
    protection_domain::ProtectionDomain,
    verbs::{QpCaps, Verbs},
    work_request::WorkRequest,
};
use std::{io, sync::Arc};
use tracing::debug;

/// Reliable-connected queue pair attached to a cm id.
///
/// `rdma_create_qp` stores the qp inside the `rdma_cm_id`, so the id is the
/// handle used to post and to destroy it.
#[derive(Debug)]
pub struct QueuePair<V: Verbs> {
    /// The backend that created the qp
    verbs: Arc<V>,
    /// The cm id owning the qp
    id: V::CmId,
    /// Capacities the qp was created with
    caps: QpCaps,
}

impl<V: Verbs> QueuePair<V> {
    /// Create a queue pair on `id` that uses `cq` for both send and receive
    /// completions
    pub(crate) fn create(
        verbs: &Arc<V>,
        id: V::CmId,
        pd: &ProtectionDomain<V>,
        cq: &CompletionQueue<V>,
        caps: QpCaps,
    ) -> io::Result<Self> {
        log_ret(
            verbs.create_qp(id, pd.raw(), cq.raw(), &caps),
            "rdma_create_qp",
        )?;
        Ok(Self {
            verbs: Arc::clone(verbs),
            id,
            caps,
        })
    }

    /// Capacities of this qp
    pub(crate) fn caps(&self) -> QpCaps {
        self.caps
    }

    /// Post a send work request
    pub(crate) fn post_send(&self, wr: &WorkRequest) -> io::Result<()> {
        debug!("post_send wr_id {} len {}", wr.wr_id, wr.sge.length);
        log_ret(self.verbs.post_send(self.id, wr), "ibv_post_send")
    }

    /// Post a receive work request
    pub(crate) fn post_recv(&self, wr: &WorkRequest) -> io::Result<()> {
        debug!("post_recv wr_id {} len {}", wr.wr_id, wr.sge.length);
        log_ret(self.verbs.post_recv(self.id, wr), "ibv_post_recv")
    }
}

impl<V: Verbs> Drop for QueuePair<V> {
    fn drop(&mut self) {
        log_release(self.verbs.destroy_qp(self.id), "queue pair");
    }
}
