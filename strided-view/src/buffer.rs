//! Aligned, shared byte storage.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::{Result, StridedError};

/// Alignment of every storage allocation, enough for any scalar [`DType`](crate::DType).
pub const BUFFER_ALIGN: usize = 16;

/// Raw heap allocation shared (through `Rc`) by every array handle that aliases it.
///
/// The buffer never hands out Rust references to its contents; all access goes
/// through raw pointers so that aliasing handles may write concurrently visible data.
pub struct Buffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// A buffer owns its allocation outright. It is not `Sync`: handles write
// through `&self`.
unsafe impl Send for Buffer {}

impl Buffer {
    /// Allocate `len` zero bytes.
    pub fn zeroed(len: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len.max(1), BUFFER_ALIGN)
            .map_err(|_| StridedError::AllocationTooLarge(len))?;
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };
        Ok(Self { ptr, len, layout })
    }

    /// Allocate `len` bytes, each set to `byte`.
    pub fn filled(len: usize, byte: u8) -> Result<Self> {
        let buf = Self::zeroed(len)?;
        if byte != 0 {
            unsafe { std::ptr::write_bytes(buf.as_ptr(), byte, len) };
        }
        Ok(buf)
    }

    /// Allocate a buffer holding a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let buf = Self::zeroed(bytes.len())?;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf.as_ptr(), bytes.len()) };
        Ok(buf)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("len", &self.len).finish()
    }
}
