//! Chunk buffers for write-buffer stripe I/O
//!
//! Stripe loads move data in whole chunks. `ChunkBuf` is a block-aligned
//! heap buffer suitable for direct I/O; `BufferPool` pre-allocates the
//! exact number of buffers the write buffer can ever need so the load path
//! can acquire without blocking.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{Error, Result};

/// Alignment for chunk buffers (4KB, matches NVMe DMA requirements)
pub const BUFFER_ALIGNMENT: usize = 4096;

// =============================================================================
// ChunkBuf
// =============================================================================

/// A block-aligned, zero-initialized heap buffer.
///
/// The buffer is freed on drop and tracked by size to prevent overruns.
/// Ownership is exclusive; concurrent access goes through borrowing.
#[derive(Debug)]
pub struct ChunkBuf {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
}

// SAFETY: ChunkBuf owns its allocation exclusively and hands out access
// only through &self / &mut self borrows.
unsafe impl Send for ChunkBuf {}
unsafe impl Sync for ChunkBuf {}

impl ChunkBuf {
    /// Allocate a new zero-initialized buffer.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::BufferAllocationFailed {
                size,
                reason: "size must be greater than 0".into(),
            });
        }

        let layout = Layout::from_size_align(size, BUFFER_ALIGNMENT).map_err(|e| {
            Error::BufferAllocationFailed {
                size,
                reason: e.to_string(),
            }
        })?;

        // SAFETY: layout has non-zero size and valid power-of-two alignment.
        let ptr = unsafe { alloc_zeroed(layout) };

        NonNull::new(ptr).map_or_else(
            || {
                Err(Error::BufferAllocationFailed {
                    size,
                    reason: "allocation returned null".into(),
                })
            },
            |ptr| Ok(Self { ptr, size, layout }),
        )
    }

    /// Size of the buffer in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Zero the entire buffer.
    pub fn zero(&mut self) {
        // SAFETY: we have exclusive access and ptr is valid for size bytes.
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.size);
        }
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for size bytes with shared access.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    #[inline]
    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for size bytes with exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for ChunkBuf {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout and not yet freed.
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

impl Deref for ChunkBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for ChunkBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for ChunkBuf {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

// =============================================================================
// BufferPool
// =============================================================================

/// A fixed pool of pre-allocated chunk buffers.
///
/// The pool is sized at creation for the worst case and never grows;
/// `try_get` is non-blocking and returns `None` on exhaustion. Buffers are
/// zeroed when returned to the pool.
#[derive(Debug)]
pub struct BufferPool {
    owner: String,
    buffers: Mutex<Vec<ChunkBuf>>,
    buffer_size: usize,
    capacity: usize,
}

impl BufferPool {
    /// Create a pool of `count` buffers of `buffer_size` bytes each.
    pub fn new(owner: impl Into<String>, buffer_size: usize, count: usize) -> Result<Self> {
        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            buffers.push(ChunkBuf::new(buffer_size)?);
        }

        Ok(Self {
            owner: owner.into(),
            buffers: Mutex::new(buffers),
            buffer_size,
            capacity: count,
        })
    }

    /// Take a buffer from the pool without blocking.
    pub fn try_get(&self) -> Option<ChunkBuf> {
        self.buffers.lock().pop()
    }

    /// Return a buffer to the pool.
    ///
    /// Buffers of the wrong size are dropped.
    pub fn put(&self, mut buf: ChunkBuf) {
        if buf.len() != self.buffer_size {
            warn!(
                owner = %self.owner,
                got = buf.len(),
                expected = self.buffer_size,
                "dropping buffer of unexpected size"
            );
            return;
        }

        buf.zero();

        let mut buffers = self.buffers.lock();
        if buffers.len() < self.capacity {
            buffers.push(buf);
        }
    }

    /// Number of buffers currently available.
    pub fn available(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Size of each buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Total capacity of the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_size_buffer_rejected() {
        let result = ChunkBuf::new(0);
        assert!(result.is_err());
    }

    #[test]
    fn test_buffer_is_zeroed_and_aligned() {
        let buf = ChunkBuf::new(8192).unwrap();
        assert_eq!(buf.len(), 8192);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(buf.as_ref().as_ptr() as usize % BUFFER_ALIGNMENT, 0);
    }

    #[test]
    fn test_buffer_write_read() {
        let mut buf = ChunkBuf::new(4096).unwrap();
        buf[0..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&buf[0..4], &[1, 2, 3, 4]);

        buf.zero();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = BufferPool::new("test", 4096, 2).unwrap();
        assert_eq!(pool.available(), 2);

        let a = pool.try_get().unwrap();
        let b = pool.try_get().unwrap();
        assert!(pool.try_get().is_none());

        pool.put(a);
        pool.put(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_pool_returns_zeroed_buffers() {
        let pool = BufferPool::new("test", 4096, 1).unwrap();

        let mut buf = pool.try_get().unwrap();
        buf[..8].copy_from_slice(&[0xAA; 8]);
        pool.put(buf);

        let buf = pool.try_get().unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_pool_drops_mismatched_buffer() {
        let pool = BufferPool::new("test", 4096, 1).unwrap();
        let _ = pool.try_get().unwrap();

        pool.put(ChunkBuf::new(1024).unwrap());
        assert_eq!(pool.available(), 0);
    }
}
