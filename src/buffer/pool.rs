//! Fixed-capacity buffer pool.
//!
//! The pool never fails: when its free list is empty a fresh buffer is
//! allocated, and returned buffers are kept for reuse. Buffers are not zeroed
//! on lease; callers always track how many bytes of a lease are meaningful.

use super::BUFFER_LEN;
use crate::lock;
use bytes::BytesMut;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::trace;

/// A pool of [`BUFFER_LEN`]-sized byte buffers.
#[derive(Debug, Default)]
pub struct BufferPool {
    /// Buffers ready to be leased again
    free: Mutex<Vec<BytesMut>>,
    /// Buffers currently checked out
    leased: AtomicUsize,
    /// Buffers ever allocated by this pool
    allocated: AtomicUsize,
}

impl BufferPool {
    /// Creates a new, empty pool.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the process-wide pool used by connections and packet groups.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<BufferPool>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(BufferPool::new))
    }

    /// Leases a buffer of exactly [`BUFFER_LEN`] bytes.
    pub fn lease(self: &Arc<Self>) -> PooledBuffer {
        let recycled = lock(&self.free).pop();
        let buf = match recycled {
            Some(buf) => buf,
            None => {
                let allocated = self.allocated.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(allocated, "Buffer pool grew");
                BytesMut::zeroed(BUFFER_LEN)
            }
        };
        self.leased.fetch_add(1, Ordering::Relaxed);

        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Number of buffers currently leased out.
    pub fn leased(&self) -> usize {
        self.leased.load(Ordering::Relaxed)
    }

    /// Number of buffers waiting in the free list.
    pub fn available(&self) -> usize {
        lock(&self.free).len()
    }

    /// Total number of buffers this pool has allocated.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    fn release(&self, buf: BytesMut) {
        // A buffer that was split or shrunk by its holder is not reusable.
        if buf.len() == BUFFER_LEN {
            lock(&self.free).push(buf);
        }
        self.leased.fetch_sub(1, Ordering::Relaxed);
    }
}

/// An exclusively owned buffer leased from a [`BufferPool`].
///
/// Dereferences to a `[u8]` of length [`BUFFER_LEN`] and goes back to its
/// pool when dropped.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Leases a buffer from the shared pool.
    pub fn lease() -> Self {
        BufferPool::shared().lease()
    }

    /// The capacity of the lease, always [`BUFFER_LEN`].
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(buf);
    }
}
