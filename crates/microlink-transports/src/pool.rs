// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reusable read buffers.
//!
//! Every link read lands in a buffer obtained from the pool; the buffer
//! travels through the received-bytes channel and is returned to the pool
//! when the consuming stage drops it. The RAII guard makes the
//! release-exactly-once rule structural rather than a convention.

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

/// Nominal length of a pooled read buffer.
pub const BUF_LEN: usize = 256;

/// A process-wide pool of fixed-size byte buffers.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
        })
    }

    /// Obtain a buffer, recycling a previously dropped one when available.
    pub fn get(self: &Arc<Self>) -> PooledBuf {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; BUF_LEN]);
        PooledBuf {
            pool: Arc::clone(self),
            buf,
            len: 0,
        }
    }

    /// Number of buffers currently sitting in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn put(&self, buf: Vec<u8>) {
        self.free.lock().push(buf);
    }
}

/// A pooled buffer holding `len` valid bytes. Dereferences to the filled
/// portion; dropping it returns the storage to the pool.
pub struct PooledBuf {
    pool: Arc<BufferPool>,
    buf: Vec<u8>,
    len: usize,
}

impl PooledBuf {
    /// The full capacity, for filling by a read call.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }

    /// Record how many bytes of the storage a read call filled.
    pub fn set_filled(&mut self, len: usize) {
        debug_assert!(len <= self.buf.len());
        self.len = len;
    }

    /// Replace the contents with a copy of `data` (must fit the nominal
    /// buffer length). Used by tests and adapters that inject data.
    pub fn copy_from(&mut self, data: &[u8]) {
        self.buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PooledBuf({} bytes)", self.len)
    }
}
