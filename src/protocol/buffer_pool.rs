//! Pool of reusable response-body buffers.
//!
//! Every response body is read into a buffer acquired here; the buffer
//! storage goes back to the pool when the [`PooledBuf`] (and thus the
//! `Response` owning it) is dropped. This keeps the reader loop free of
//! per-response allocations under steady load.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// Buffers above this capacity are not retained.
const MAX_RETAINED_CAPACITY: usize = 1024 * 1024;

/// Maximum number of idle buffers kept in the pool.
const MAX_RETAINED_BUFFERS: usize = 64;

/// A shared pool of byte buffers.
#[derive(Clone, Default)]
pub struct BufferPool {
    idle: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a buffer of exactly `len` bytes, zero-filled.
    pub fn acquire(&self, len: usize) -> PooledBuf {
        let mut buf = self.idle.lock().pop().unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);

        PooledBuf {
            buf,
            idle: Arc::clone(&self.idle),
        }
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

/// A buffer borrowed from a [`BufferPool`]; returns its storage on drop.
pub struct PooledBuf {
    buf: Vec<u8>,
    idle: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf").field("len", &self.buf.len()).finish()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if self.buf.capacity() == 0 || self.buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }

        let mut idle = self.idle.lock();
        if idle.len() < MAX_RETAINED_BUFFERS {
            idle.push(std::mem::take(&mut self.buf));
        }
    }
}
