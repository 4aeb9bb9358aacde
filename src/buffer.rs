//! Reusable byte buffers for template rendering
//!
//! Buffers are checked out with [`BufferPool::get`] and go back to the pool
//! when the [`PooledBuffer`] is dropped, on every exit path.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Default capacity of a pooled buffer (64 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum number of idle buffers kept around
const MAX_IDLE: usize = 16;

/// Pool of pre-allocated byte buffers, safe to share between concurrent renders
#[derive(Debug)]
pub struct BufferPool {
    capacity: usize,
    idle: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            idle: Mutex::new(Vec::new()),
        })
    }

    /// Check out an empty buffer
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.capacity));
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Number of buffers waiting for reuse
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn put(&self, mut buf: Vec<u8>) {
        // Oversized buffers from unusually large renders are not worth keeping
        if buf.capacity() > self.capacity * 4 {
            return;
        }
        buf.clear();
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push(buf);
        }
    }
}

/// A buffer on loan from a [`BufferPool`]
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}
