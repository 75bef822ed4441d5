use super::{MrAccess, MrBuffer};
use crate::{
    access::AccessFlag, error_utilities::log_release, protection_domain::ProtectionDomain,
    verbs::Verbs,
};
use enumflags2::BitFlags;
use std::{fmt::Debug, io, ptr::NonNull, sync::Arc};
use tracing::error;

/// Registered Memory Region
pub struct MemoryRegion<V: Verbs> {
    /// The backend that registered the region
    verbs: Arc<V>,
    /// the internal `ibv_mr` handle
    inner_mr: V::Mr,
    /// the addr of the registered buffer
    addr: NonNull<u8>,
    /// the len of the registered buffer
    len: usize,
    /// local key
    lkey: u32,
    /// access flags of the registration
    access: BitFlags<AccessFlag>,
}

impl<V: Verbs> MrAccess for MemoryRegion<V> {
    #[allow(clippy::as_conversions)]
    fn addr(&self) -> usize {
        self.addr.as_ptr() as usize
    }

    fn length(&self) -> usize {
        self.len
    }

    fn lkey(&self) -> u32 {
        self.lkey
    }
}

impl<V: Verbs> MemoryRegion<V> {
    /// Register the whole of `buf` in the protection domain `pd`
    pub(crate) fn register(
        verbs: &Arc<V>,
        pd: &ProtectionDomain<V>,
        buf: &MrBuffer,
        access: BitFlags<AccessFlag>,
    ) -> io::Result<Self> {
        let addr = buf.as_non_null();
        let len = buf.len();
        let inner_mr = verbs.reg_mr(pd.raw(), addr, len, access).map_err(|err| {
            error!(
                "ibv_reg_mr err, arguments:\n pd:{:?},\n addr:{:?},\n len:{:?},\n access:{:?}\n, err info:{:?}",
                pd, addr, len, access, err
            );
            err
        })?;
        Ok(Self {
            lkey: verbs.mr_lkey(inner_mr),
            verbs: Arc::clone(verbs),
            inner_mr,
            addr,
            len,
            access,
        })
    }

    /// Access flags of this registration
    #[must_use]
    pub fn access(&self) -> BitFlags<AccessFlag> {
        self.access
    }
}

impl<V: Verbs> Debug for MemoryRegion<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("inner_mr", &self.inner_mr)
            .field("addr", &self.addr)
            .field("len", &self.len)
            .finish()
    }
}

/// SAFETY: the handle is only used through `verbs`, which is `Send + Sync`
unsafe impl<V: Verbs> Sync for MemoryRegion<V> {}

/// SAFETY: the handle is only used through `verbs`, which is `Send + Sync`
unsafe impl<V: Verbs> Send for MemoryRegion<V> {}

impl<V: Verbs> Drop for MemoryRegion<V> {
    fn drop(&mut self) {
        log_release(self.verbs.dereg_mr(self.inner_mr), "memory region");
    }
}
