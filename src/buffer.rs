//! Reusable copy buffers
//!
//! Every copy borrows one fixed-size buffer for its whole duration. Buffers go
//! back to the pool when the [`PooledBuffer`] is dropped, so a copy that bails
//! out early on an error still returns its memory.

use crossbeam_queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Size of a copy buffer unless configured otherwise (32 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// A pool of equally sized byte buffers shared by all workers.
#[derive(Debug)]
pub struct BufferPool {
    queue: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
}

impl BufferPool {
    /// Creates a pool handing out buffers of `buffer_size` bytes, keeping at
    /// most `max_buffers` idle buffers around for reuse.
    pub fn new(buffer_size: usize, max_buffers: usize) -> Arc<Self> {
        assert!(buffer_size > 0, "buffer_size must be at least 1");
        Arc::new(Self {
            queue: ArrayQueue::new(max_buffers.max(1)),
            buffer_size,
        })
    }

    /// Size in bytes of every buffer this pool hands out
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of idle buffers currently cached
    pub fn available(&self) -> usize {
        self.queue.len()
    }

    /// Borrows a buffer, allocating a fresh one when none is idle.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let inner = self
            .queue
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);

        PooledBuffer {
            pool: Arc::clone(self),
            inner,
        }
    }
}

/// A buffer borrowed from a [`BufferPool`].
///
/// Contents are whatever the previous borrower left behind.
#[derive(Debug)]
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    inner: Vec<u8>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.inner);
        // A full queue means enough idle buffers already; let this one go.
        let _ = self.pool.queue.push(buf);
    }
}
