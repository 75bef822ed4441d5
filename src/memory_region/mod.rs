/// Heap buffer backing a registration
mod buffer;
/// Registered memory region
mod raw;

pub use buffer::MrBuffer;
pub use raw::MemoryRegion;
use std::fmt::Debug;

/// Rdma Memory Region Access
pub trait MrAccess: Sync + Send + Debug {
    /// Get the start addr
    fn addr(&self) -> usize;

    /// Get the length
    fn length(&self) -> usize;

    /// Get the local key
    fn lkey(&self) -> u32;
}
