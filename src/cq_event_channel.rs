use crate::error_utilities::{log_release, log_ret};
use crate::verbs::Verbs;
use std::{io, sync::Arc};

/// Completion notification channel wrapper for `ibv_comp_channel`
#[derive(Debug)]
pub struct CompChannel<V: Verbs> {
    /// The backend that created the channel
    verbs: Arc<V>,
    /// The inner `ibv_comp_channel` handle
    inner_cc: V::CompChannel,
}

impl<V: Verbs> CompChannel<V> {
    /// Get the inner `ibv_comp_channel` handle
    pub(crate) fn raw(&self) -> V::CompChannel {
        self.inner_cc
    }

    /// Create a new completion channel on the device backing `id`
    pub(crate) fn new(verbs: &Arc<V>, id: V::CmId) -> io::Result<Self> {
        let inner_cc = log_ret(verbs.create_comp_channel(id), "ibv_create_comp_channel")?;
        Ok(Self {
            verbs: Arc::clone(verbs),
            inner_cc,
        })
    }
}

impl<V: Verbs> Drop for CompChannel<V> {
    fn drop(&mut self) {
        log_release(
            self.verbs.destroy_comp_channel(self.inner_cc),
            "completion channel",
        );
    }
}
