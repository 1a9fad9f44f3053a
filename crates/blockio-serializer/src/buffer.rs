//! Block buffers and their allocator
//!
//! [`DataBuffer`] is the only way callers hold a block-sized buffer. It is
//! created by allocating or cloning through a [`BufferAllocator`], cannot be
//! copied, and goes back to the allocator exactly once: through
//! [`DataBuffer::release`], through [`DataBuffer::freeze`] (which hands the
//! contents to a write as immutable bytes), or on drop.

use blockio_common::{Error, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

/// Source of block-sized buffers
pub trait BufferAllocator: Send + Sync {
    /// Size of every buffer handed out
    fn block_size(&self) -> usize;

    /// Get a zeroed buffer of `block_size` bytes
    fn allocate(&self) -> Result<BytesMut>;

    /// Get a buffer holding a copy of `src`
    fn clone_buf(&self, src: &[u8]) -> Result<BytesMut> {
        let mut buf = self.allocate()?;
        let len = src.len().min(buf.len());
        buf[..len].copy_from_slice(&src[..len]);
        Ok(buf)
    }

    /// Return a buffer
    fn free(&self, buf: BytesMut);

    /// Account for a buffer that left the allocator for good
    fn detach(&self) {}
}

/// Pooled allocator of zeroed block buffers
///
/// Released buffers are kept for reuse up to `capacity`. Once closed the
/// pool refuses to allocate, which is how an engine that is shutting down
/// reports that no allocator is available.
pub struct BufferPool {
    block_size: usize,
    capacity: usize,
    free: Mutex<Vec<BytesMut>>,
    closed: AtomicBool,
    allocations: AtomicU64,
    reused: AtomicU64,
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Create a pool of `block_size` buffers keeping at most `capacity` spares
    #[must_use]
    pub fn new(block_size: usize, capacity: usize) -> Self {
        Self {
            block_size,
            capacity,
            free: Mutex::new(Vec::with_capacity(capacity)),
            closed: AtomicBool::new(false),
            allocations: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Stop handing out buffers and drop the spares
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.free.lock().clear();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Buffers currently owned by callers
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Total successful allocations
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Allocations served from the spare list
    #[must_use]
    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }

    /// Spare buffers waiting for reuse
    #[must_use]
    pub fn spare(&self) -> usize {
        self.free.lock().len()
    }
}

impl BufferAllocator for BufferPool {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate(&self) -> Result<BytesMut> {
        if self.is_closed() {
            return Err(Error::AllocatorUnavailable);
        }

        let buf = match self.free.lock().pop() {
            Some(mut buf) => {
                buf.fill(0);
                self.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => BytesMut::zeroed(self.block_size),
        };

        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(buf)
    }

    fn free(&self, buf: BytesMut) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        if self.is_closed() || buf.len() != self.block_size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buf);
        }
    }

    fn detach(&self) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("block_size", &self.block_size)
            .field("capacity", &self.capacity)
            .field("outstanding", &self.outstanding())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Exclusively owned block buffer
pub struct DataBuffer {
    buf: Option<BytesMut>,
    allocator: Arc<dyn BufferAllocator>,
}

impl DataBuffer {
    /// Obtain a fresh zeroed buffer
    pub fn allocate(allocator: &Arc<dyn BufferAllocator>) -> Result<Self> {
        let buf = allocator.allocate()?;
        Ok(Self {
            buf: Some(buf),
            allocator: Arc::clone(allocator),
        })
    }

    /// Obtain a new buffer holding a copy of `other`
    pub fn clone_from(allocator: &Arc<dyn BufferAllocator>, other: &Self) -> Result<Self> {
        let buf = allocator.clone_buf(other.as_slice())?;
        Ok(Self {
            buf: Some(buf),
            allocator: Arc::clone(allocator),
        })
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.owned()[..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("data buffer used after release"))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.owned().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.owned().is_empty()
    }

    /// Copy `src` into the start of the buffer, zeroing the rest
    pub fn copy_from(&mut self, src: &[u8]) {
        let dst = self.as_mut_slice();
        let len = src.len().min(dst.len());
        dst[..len].copy_from_slice(&src[..len]);
        dst[len..].fill(0);
    }

    /// Return the buffer to its allocator
    pub fn release(mut self) {
        let buf = self.take();
        self.allocator.free(buf);
    }

    /// Hand the contents over as immutable bytes for a block write
    #[must_use]
    pub fn freeze(mut self) -> Bytes {
        let buf = self.take();
        self.allocator.detach();
        buf.freeze()
    }

    fn owned(&self) -> &BytesMut {
        self.buf
            .as_ref()
            .unwrap_or_else(|| unreachable!("data buffer used after release"))
    }

    fn take(&mut self) -> BytesMut {
        self.buf
            .take()
            .unwrap_or_else(|| unreachable!("data buffer released twice"))
    }
}

impl Drop for DataBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            debug!(len = buf.len(), "data buffer dropped without release");
            self.allocator.free(buf);
        }
    }
}

impl fmt::Debug for DataBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBuffer")
            .field("len", &self.buf.as_ref().map(BytesMut::len))
            .finish_non_exhaustive()
    }
}
