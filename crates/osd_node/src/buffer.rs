//! Pooled payload buffers.
//!
//! The transport reads request payloads into buffers borrowed from a pool.
//! Every path that drops a request (admission rejection, stage termination)
//! returns the buffer before the caller is notified.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};

/// Size of one pooled payload buffer.
pub const PAYLOAD_BUFFER_SIZE: usize = 128 * 1024;

pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    buffer_size: usize,
    max_pooled: usize,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            buffer_size: buffer_size.max(1),
            max_pooled,
            outstanding: AtomicUsize::new(0),
        })
    }

    pub fn allocate(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            buf: Some(buf),
            pool: self.clone(),
        }
    }

    pub fn copy_from(self: &Arc<Self>, data: &[u8]) -> PooledBuffer {
        let mut buf = self.allocate();
        buf.extend_from_slice(data);
        buf
    }

    /// Buffers currently handed out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Buffers waiting for reuse.
    pub fn pooled(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn give_back(&self, mut buf: BytesMut) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }
}

/// A buffer on loan from a `BufferPool`. Returned on `release` or drop.
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    pub fn len(&self) -> usize {
        self.buf.as_ref().map_or(0, BytesMut::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        if let Some(buf) = self.buf.as_mut() {
            buf.extend_from_slice(data);
        }
    }

    /// Detach the contents from the pool.
    pub fn freeze(mut self) -> Bytes {
        match self.buf.take() {
            Some(buf) => {
                self.pool.outstanding.fetch_sub(1, Ordering::Relaxed);
                buf.freeze()
            }
            None => Bytes::new(),
        }
    }

    pub fn release(mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .finish()
    }
}
