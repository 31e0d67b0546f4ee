//! Recycling pool for scratch byte buffers.
//!
//! Scratch buffers are handed out as [`BytesMut`] and returned with
//! [`BufferPool::give`]. Once frozen into [`Bytes`] a buffer is shared by
//! cloning the handle; the allocation is released when the last clone drops.

use std::sync::Mutex;

use bytes::BytesMut;

/// Pool of reusable [`BytesMut`] buffers with a fixed initial capacity.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    capacity: usize,
    max_retained: usize,
}

impl BufferPool {
    /// Create a pool whose buffers start with `capacity` bytes.
    pub fn new(capacity: usize, max_retained: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            capacity,
            max_retained,
        }
    }

    /// Take an empty buffer from the pool, allocating if none is free.
    pub fn take(&self) -> BytesMut {
        let recycled = self
            .buffers
            .lock()
            .expect("buffer pool lock poisoned")
            .pop();
        recycled.unwrap_or_else(|| BytesMut::with_capacity(self.capacity))
    }

    /// Return a buffer. Buffers that grew beyond 4x the pool capacity, or
    /// that arrive while the pool is full, are dropped.
    pub fn give(&self, mut buffer: BytesMut) {
        if buffer.capacity() > self.capacity * 4 {
            return;
        }
        buffer.clear();
        let mut buffers = self.buffers.lock().expect("buffer pool lock poisoned");
        if buffers.len() < self.max_retained {
            buffers.push(buffer);
        }
    }

    /// Number of idle buffers held by the pool.
    pub fn idle(&self) -> usize {
        self.buffers.lock().expect("buffer pool lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn take_allocates_with_capacity() {
        let pool = BufferPool::new(64, 2);
        let buf = pool.take();
        assert!(buf.capacity() >= 64);
        assert!(buf.is_empty());
    }

    #[test]
    fn give_recycles_cleared_buffer() {
        let pool = BufferPool::new(64, 2);
        let mut buf = pool.take();
        buf.put_slice(b"scratch");
        pool.give(buf);
        assert_eq!(pool.idle(), 1);
        let again = pool.take();
        assert!(again.is_empty());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn pool_retains_at_most_max() {
        let pool = BufferPool::new(16, 1);
        pool.give(pool.take());
        pool.give(BytesMut::with_capacity(16));
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn oversized_buffers_are_dropped() {
        let pool = BufferPool::new(8, 4);
        pool.give(BytesMut::with_capacity(1024));
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn frozen_clones_share_storage() {
        let pool = BufferPool::new(16, 1);
        let mut buf = pool.take();
        buf.put_slice(b"shared");
        let frozen = buf.freeze();
        let for_writer = frozen.clone();
        drop(frozen);
        assert_eq!(&for_writer[..], b"shared");
    }
}
