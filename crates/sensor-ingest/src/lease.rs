//! Pooled raw frame buffers with scoped release.
//!
//! A [`LeasedBuffer`] is handed to the consumer together with its frame. The
//! backing allocation goes back to the owning [`BufferPool`] when the lease is
//! dropped, so a consumer releases the buffer on every exit path without any
//! explicit unlock call.

use std::{
    fmt, mem,
    sync::{Arc, Mutex, Weak},
};

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
}

impl PoolInner {
    fn release(&self, mut buffer: Vec<u8>) {
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.capacity {
                buffer.clear();
                free.push(buffer);
            }
        }
    }
}

/// Free list of frame-sized allocations shared between a source and its consumers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool holding up to `capacity` idle buffers of `buffer_len` bytes.
    pub fn new(capacity: usize, buffer_len: usize) -> Self {
        let free = (0..capacity).map(|_| Vec::with_capacity(buffer_len)).collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                capacity,
            }),
        }
    }

    /// Lease a zero-filled buffer of exactly `len` bytes.
    ///
    /// Falls back to a fresh allocation when every pooled buffer is out.
    pub fn acquire(&self, len: usize) -> LeasedBuffer {
        let mut data = self
            .inner
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_default();
        data.resize(len, 0);
        LeasedBuffer {
            data,
            home: Some(Arc::downgrade(&self.inner)),
        }
    }

    /// Number of idle buffers currently parked in the pool.
    pub fn available(&self) -> usize {
        self.inner.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

/// Raw frame bytes on loan from a [`BufferPool`].
pub struct LeasedBuffer {
    data: Vec<u8>,
    home: Option<Weak<PoolInner>>,
}

impl LeasedBuffer {
    /// Wrap bytes that do not belong to any pool.
    pub fn detached(data: Vec<u8>) -> Self {
        Self { data, home: None }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for LeasedBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.home.take().and_then(|home| home.upgrade()) {
            pool.release(mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for LeasedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeasedBuffer")
            .field("len", &self.data.len())
            .field("pooled", &self.home.is_some())
            .finish()
    }
}
