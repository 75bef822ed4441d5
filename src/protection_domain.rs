use crate::{
    error_utilities::{log_release, log_ret},
    verbs::Verbs,
};
use std::{io, sync::Arc};

/// Protection Domain Wrapper
#[derive(Debug)]
pub struct ProtectionDomain<V: Verbs> {
    /// The backend that allocated the pd
    verbs: Arc<V>,
    /// Internal `ibv_pd` handle
    inner_pd: V::Pd,
}

impl<V: Verbs> ProtectionDomain<V> {
    /// Get the internal `ibv_pd` handle
    pub(crate) fn raw(&self) -> V::Pd {
        self.inner_pd
    }

    /// Create a protection domain scoped to the device backing `id`
    pub(crate) fn create(verbs: &Arc<V>, id: V::CmId) -> io::Result<Self> {
        let inner_pd = log_ret(verbs.alloc_pd(id), "ibv_alloc_pd")?;
        Ok(Self {
            verbs: Arc::clone(verbs),
            inner_pd,
        })
    }
}

impl<V: Verbs> Drop for ProtectionDomain<V> {
    fn drop(&mut self) {
        log_release(self.verbs.dealloc_pd(self.inner_pd), "protection domain");
    }
}
