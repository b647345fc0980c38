//! Reusable relay buffers.

use std::{
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crossbeam::queue::ArrayQueue;
use serde::Serialize;

pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Fixed-size byte buffers shared by every relay.
///
/// `acquire` never blocks: a miss allocates. Returned buffers beyond the pool
/// capacity are simply dropped.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

struct Inner {
    free: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
    acquired: AtomicU64,
    released: AtomicU64,
    allocated: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub buffer_size: usize,
    pub acquired: u64,
    pub released: u64,
    pub allocated: u64,
    pub idle: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                free: ArrayQueue::new(capacity.max(1)),
                buffer_size: buffer_size.max(1),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
                allocated: AtomicU64::new(0),
            }),
        }
    }

    pub fn acquire(&self) -> PooledBuf {
        let buf = match self.inner.free.pop() {
            Some(buf) => buf,
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.inner.buffer_size]
            }
        };
        self.inner.acquired.fetch_add(1, Ordering::Relaxed);
        PooledBuf {
            buf,
            pool: self.inner.clone(),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            buffer_size: self.inner.buffer_size,
            acquired: self.inner.acquired.load(Ordering::Relaxed),
            released: self.inner.released.load(Ordering::Relaxed),
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            idle: self.inner.free.len(),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_POOL_CAPACITY)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("stats", &self.stats())
            .finish()
    }
}

/// A buffer on loan from a [`BufferPool`]; goes back to the pool on drop.
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<Inner>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.released.fetch_add(1, Ordering::Relaxed);
        let buf = std::mem::take(&mut self.buf);
        if buf.len() == self.pool.buffer_size {
            let _ = self.pool.free.push(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.buf.len())
            .finish()
    }
}
