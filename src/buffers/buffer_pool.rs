//! Pooled byte buffers for packets and reassembled messages.
//!
//! Buffers are handed out as [PooledBuf] handles that go back to their pool when they are
//!  dropped, so a consumer releases them on every exit path without explicit bookkeeping.

use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};
use bytes::BytesMut;
use tracing::{debug, trace};

#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    buf_size: usize,
    max_pool_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    /// `buf_size` is the initial capacity of new buffers; buffers can grow beyond it
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            inner: Arc::new(PoolInner {
                buf_size,
                max_pool_size,
                buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
            }),
        }
    }

    pub fn get_from_pool(&self) -> PooledBuf {
        let pooled = self.inner.buffers.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        let buf = match pooled {
            Some(buf) => {
                trace!("returning buffer from pool");
                buf
            }
            None => {
                debug!("no buffer in pool: creating new buffer");
                BytesMut::with_capacity(self.inner.buf_size)
            }
        };

        PooledBuf {
            buf,
            pool: self.inner.clone(),
        }
    }

    /// convenience for a pooled buffer initialized with a copy of some data
    pub fn copy_from_slice(&self, data: &[u8]) -> PooledBuf {
        let mut result = self.get_from_pool();
        result.buf_mut().extend_from_slice(data);
        result
    }

    /// number of buffers currently waiting in the pool
    pub fn num_pooled(&self) -> usize {
        self.inner.buffers.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl PoolInner {
    fn return_to_pool(&self, mut buffer: BytesMut) {
        if buffer.capacity() < self.buf_size {
            debug!("returned buffer has a capacity of {} bytes, less than the regular {} - discarding", buffer.capacity(), self.buf_size);
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock()
            .unwrap_or_else(PoisonError::into_inner);
        if buffers.len() < self.max_pool_size {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}

/// A buffer borrowed from a [BufferPool]. It dereferences to its content and returns to the pool
///  when dropped.
pub struct PooledBuf {
    buf: BytesMut,
    pool: Arc<PoolInner>,
}

impl PooledBuf {
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.return_to_pool(buf);
    }
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

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl Debug for PooledBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.buf.as_ref().fmt(f)
    }
}
