use crate::{
    error_utilities::log_release,
    event_channel::EventChannel,
    verbs::Verbs,
};
use std::{io, sync::Arc};

/// Owned `rdma_cm_id`
#[derive(Debug)]
pub struct CmId<V: Verbs> {
    /// The backend that created the id
    verbs: Arc<V>,
    /// The inner `rdma_cm_id` handle
    inner_id: V::CmId,
}

impl<V: Verbs> CmId<V> {
    /// Create an id reporting its events to `ec`
    pub fn create(ec: &EventChannel<V>) -> io::Result<Self> {
        let verbs = ec.verbs();
        let inner_id = verbs.create_id(ec.raw())?;
        Ok(Self {
            verbs: Arc::clone(verbs),
            inner_id,
        })
    }

    /// Take ownership of an id that rdma_cm created, i.e. the id carried by a
    /// connect request
    pub(crate) fn adopt(verbs: &Arc<V>, inner_id: V::CmId) -> Self {
        Self {
            verbs: Arc::clone(verbs),
            inner_id,
        }
    }

    /// Get the inner `rdma_cm_id` handle
    #[inline]
    pub(crate) fn raw(&self) -> V::CmId {
        self.inner_id
    }
}

impl<V: Verbs> Drop for CmId<V> {
    fn drop(&mut self) {
        log_release(self.verbs.destroy_id(self.inner_id), "cm id");
    }
}
