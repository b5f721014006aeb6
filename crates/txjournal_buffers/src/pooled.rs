//! Free-list pooling provider.

use parking_lot::Mutex;

use crate::BufferProvider;

/// Default bound on the number of pooled buffers.
const DEFAULT_MAX_BUFFERS: usize = 16;

/// Default bound on the capacity of a single pooled buffer.
///
/// Buffers larger than this are dropped on recycle instead of retained,
/// so one oversized scan cannot pin its allocation forever.
const DEFAULT_MAX_BUFFER_CAPACITY: usize = 1024 * 1024;

/// A provider backed by a bounded free list.
///
/// `poll` prefers the smallest pooled buffer that satisfies the request and
/// falls back to a fresh allocation when none fits. `recycle` clears the
/// buffer and retains it unless either bound is exceeded.
#[derive(Debug)]
pub struct PooledBufferProvider {
    max_buffers: usize,
    max_buffer_capacity: usize,
    pool: Mutex<Vec<Vec<u8>>>,
}

impl PooledBufferProvider {
    /// Creates a pool with the default bounds.
    #[must_use]
    pub fn new() -> Self {
        Self::with_bounds(DEFAULT_MAX_BUFFERS, DEFAULT_MAX_BUFFER_CAPACITY)
    }

    /// Creates a pool retaining at most `max_buffers` buffers of at most
    /// `max_buffer_capacity` bytes each.
    #[must_use]
    pub fn with_bounds(max_buffers: usize, max_buffer_capacity: usize) -> Self {
        Self {
            max_buffers,
            max_buffer_capacity,
            pool: Mutex::new(Vec::new()),
        }
    }

    /// Returns the number of buffers currently pooled.
    #[must_use]
    pub fn pooled(&self) -> usize {
        self.pool.lock().len()
    }
}

impl Default for PooledBufferProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferProvider for PooledBufferProvider {
    fn poll(&self, min_capacity: usize) -> Vec<u8> {
        let mut pool = self.pool.lock();

        // Smallest pooled buffer that still satisfies the request.
        let best = pool
            .iter()
            .enumerate()
            .filter(|(_, buf)| buf.capacity() >= min_capacity)
            .min_by_key(|(_, buf)| buf.capacity())
            .map(|(idx, _)| idx);

        match best {
            Some(idx) => pool.swap_remove(idx),
            None => Vec::with_capacity(min_capacity),
        }
    }

    fn recycle(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() == 0 || buffer.capacity() > self.max_buffer_capacity {
            return;
        }

        buffer.clear();

        let mut pool = self.pool.lock();
        if pool.len() < self.max_buffers {
            pool.push(buffer);
        }
    }
}
