//! Reusable datagram buffers
//!
//! A bounded free list shared between the tasks of one multiplexer. Buffers
//! return to the pool when their [`PooledBuffer`] is dropped; a full pool
//! simply lets them deallocate. A miss only costs an allocation.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Default number of idle buffers kept around
pub const DEFAULT_POOL_CAPACITY: usize = 32;

struct PoolInner {
    buffers: Vec<Vec<u8>>,
    max_pooled: usize,
    buffer_size: usize,
}

/// Shared free list of fixed-size datagram buffers
#[derive(Clone)]
pub struct PacketBufferPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl Default for PacketBufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, MAX_DATAGRAM_SIZE)
    }
}

impl fmt::Debug for PacketBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBufferPool")
            .field("idle", &self.idle())
            .finish()
    }
}

impl PacketBufferPool {
    pub fn new(max_pooled: usize, buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                buffers: Vec::with_capacity(max_pooled),
                max_pooled,
                buffer_size,
            })),
        }
    }

    /// Borrow a zero-filled buffer of the pool's full buffer size.
    ///
    /// Receivers copy the datagram out and keep the buffer for the next
    /// receive; queued data never holds a pool-sized allocation.
    pub fn acquire(&self) -> PooledBuffer {
        let (recycled, size) = match self.inner.lock() {
            Ok(mut pool) => (pool.buffers.pop(), pool.buffer_size),
            Err(poisoned) => (None, poisoned.get_ref().buffer_size),
        };

        let mut buf = recycled.unwrap_or_default();
        buf.clear();
        buf.resize(size, 0);
        PooledBuffer {
            buf: Some(buf),
            pool: self.clone(),
        }
    }

    fn release(&self, buf: Vec<u8>) {
        if let Ok(mut pool) = self.inner.lock() {
            if pool.buffers.len() < pool.max_pooled && buf.capacity() >= pool.buffer_size {
                pool.buffers.push(buf);
            }
        }
    }

    /// Number of idle buffers currently held
    pub fn idle(&self) -> usize {
        self.inner.lock().map(|pool| pool.buffers.len()).unwrap_or(0)
    }
}

/// Buffer on loan from a [`PacketBufferPool`]
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: PacketBufferPool,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer").field("len", &self.len()).finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
