use enumflags2::{bitflags, BitFlags};

/// A wrapper for `ibv_access_flags`, hide the ibv binding types
#[bitflags]
#[repr(u64)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessFlag {
    /// local write permission
    LocalWrite,
    /// remote write permission
    RemoteWrite,
    /// remote read permission
    RemoteRead,
    /// remote atomic operation permission
    RemoteAtomic,
}

/// Which side of a flow a registration belongs to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// Posts the send
    Sender,
    /// Posts the receive
    Receiver,
}

/// Access flags for the buffer registration of `role`.
///
/// Local and remote write are always granted, remote read only on the
/// receiving side.
#[inline]
#[must_use]
pub fn mr_access(role: Role) -> BitFlags<AccessFlag> {
    let access = AccessFlag::LocalWrite | AccessFlag::RemoteWrite;
    match role {
        Role::Sender => access,
        Role::Receiver => access | AccessFlag::RemoteRead,
    }
}

/// Convert `BitFlags<AccessFlag>` into `ibv_access_flags`
#[cfg(feature = "ibverbs")]
#[inline]
#[must_use]
pub(crate) fn flags_into_ibv_access(flags: BitFlags<AccessFlag>) -> rdma_sys::ibv_access_flags {
    use rdma_sys::ibv_access_flags;

    let mut ret = ibv_access_flags(0);
    if flags.contains(AccessFlag::LocalWrite) {
        ret |= ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
    }
    if flags.contains(AccessFlag::RemoteWrite) {
        ret |= ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
    }
    if flags.contains(AccessFlag::RemoteRead) {
        ret |= ibv_access_flags::IBV_ACCESS_REMOTE_READ;
    }
    if flags.contains(AccessFlag::RemoteAtomic) {
        ret |= ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC;
    }
    ret
}

#[cfg(test)]
mod access_test {
    use super::*;

    #[test]
    fn remote_read_only_on_receiver() {
        let sender = mr_access(Role::Sender);
        let receiver = mr_access(Role::Receiver);
        assert!(sender.contains(AccessFlag::LocalWrite | AccessFlag::RemoteWrite));
        assert!(!sender.contains(AccessFlag::RemoteRead));
        assert!(receiver.contains(AccessFlag::RemoteRead));
        assert!(!receiver.contains(AccessFlag::RemoteAtomic));
    }
}
