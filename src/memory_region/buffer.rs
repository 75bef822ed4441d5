use std::{
    alloc::{self, Layout},
    fmt::Debug,
    io,
    ptr::NonNull,
    slice,
};

/// A zero-initialized heap allocation handed to the device for registration.
///
/// The allocation is addressed through a raw pointer rather than a `Box` since
/// the device writes into it behind the compiler's back once it is registered.
pub struct MrBuffer {
    /// Start of the allocation
    ptr: NonNull<u8>,
    /// Layout used for allocation and deallocation
    layout: Layout,
}

impl MrBuffer {
    /// Allocate `len` zeroed bytes. `len` must be at least 1.
    pub fn zeroed(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer size must be at least 1 byte",
            ));
        }
        let layout = Layout::array::<u8>(len)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        // SAFETY: layout has a non-zero size
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        Ok(Self { ptr, layout })
    }

    /// Start of the buffer
    #[inline]
    #[must_use]
    pub fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Number of bytes
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Always false, empty buffers can not be allocated
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The buffer as a byte slice
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes and initialized by alloc_zeroed
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    /// The buffer as a mutable byte slice
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes and we hold the only reference
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }
}

impl Debug for MrBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MrBuffer")
            .field("addr", &self.ptr)
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for MrBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with the same layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// SAFETY: owned allocation
unsafe impl Send for MrBuffer {}
/// SAFETY: shared access only hands out `&[u8]`
unsafe impl Sync for MrBuffer {}
