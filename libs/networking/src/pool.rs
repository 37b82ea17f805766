//! Lock-free scratch buffer pool.
//!
//! Buffers are handed out as [`PooledBuffer`] guards and go back to the pool
//! when the guard drops, on every exit path. When the pool is full the
//! buffer is simply freed.
//!
//! ```
//! use craftgate_networking::BufferPool;
//! use std::sync::Arc;
//!
//! let pool = Arc::new(BufferPool::new(4, 1024));
//! let buffer = pool.get();
//! assert_eq!(buffer.len(), 1024);
//! drop(buffer);
//! assert_eq!(pool.available(), 1);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Copy buffer size used by the relay.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Buffers kept around for reuse.
pub const DEFAULT_POOL_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct BufferPool {
    buffers: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
}

impl BufferPool {
    #[must_use]
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity.max(1)),
            buffer_size,
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, DEFAULT_BUFFER_SIZE)
    }

    /// Take a buffer of `buffer_size` bytes, reusing a pooled one if possible.
    #[must_use]
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let mut buffer = self
            .buffers
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_size));
        buffer.resize(self.buffer_size, 0);
        PooledBuffer {
            buffer,
            pool: Arc::clone(self),
        }
    }

    /// Take an empty buffer for building a packet. Capacity is at least `buffer_size`.
    #[must_use]
    pub fn scratch(self: &Arc<Self>) -> PooledBuffer {
        let mut buffer = self.get();
        buffer.clear();
        buffer
    }

    fn give_back(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        // A full pool drops the buffer.
        let _ = self.buffers.push(buffer);
    }

    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers currently waiting in the pool.
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffers.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// A buffer borrowed from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buffer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_are_reused() {
        let pool = Arc::new(BufferPool::new(2, 64));
        let mut first = pool.get();
        first[0] = 7;
        let capacity = first.capacity();
        drop(first);
        assert_eq!(pool.available(), 1);

        let second = pool.get();
        assert_eq!(second.len(), 64);
        assert_eq!(second[0], 0);
        assert_eq!(second.capacity(), capacity);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_full_pool_drops_extra_buffers() {
        let pool = Arc::new(BufferPool::new(1, 8));
        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_scratch_is_empty() {
        let pool = Arc::new(BufferPool::new(1, 32));
        let mut scratch = pool.scratch();
        assert!(scratch.is_empty());
        assert!(scratch.capacity() >= 32);
        scratch.extend_from_slice(b"packet");
        assert_eq!(&scratch[..], b"packet");
    }

    #[test]
    fn test_returned_on_error_path() {
        fn fails(pool: &Arc<BufferPool>) -> Result<(), &'static str> {
            let _buffer = pool.get();
            Err("boom")
        }

        let pool = Arc::new(BufferPool::new(4, 8));
        assert!(fails(&pool).is_err());
        assert_eq!(pool.available(), 1);
    }
}
