//! Process-wide singleton pool of reusable byte buffers, bucketed by
//! power-of-two capacity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::protocol_constants::{
    POOL_CLEANUP_MIN_INTERVAL_SECS, POOL_DEFAULT_MAX_IDLE_SECS, POOL_MAX_BUCKET_ENTRIES,
    POOL_MIN_BUCKET_SIZE,
};

struct Entry {
    bytes: Vec<u8>,
    last_used: Instant,
}

struct Bucket {
    entries: Vec<Entry>,
}

struct Inner {
    buckets: HashMap<usize, Bucket>,
    last_cleanup: Instant,
}

/// Read-only, effectively-lock-free snapshot of pool activity. Individual
/// fields may be momentarily stale relative to each other; callers accept
/// that in exchange for never blocking on the pool's mutex to read stats.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub total: AtomicU64,
    pub available: AtomicU64,
    pub bytes_allocated: AtomicU64,
    pub buffers_created: AtomicU64,
    pub buffers_reused: AtomicU64,
    pub cleanup_operations: AtomicU64,
}

impl PoolStats {
    fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            available: self.available.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            buffers_created: self.buffers_created.load(Ordering::Relaxed),
            buffers_reused: self.buffers_reused.load(Ordering::Relaxed),
            cleanup_operations: self.cleanup_operations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub total: u64,
    pub available: u64,
    pub bytes_allocated: u64,
    pub buffers_created: u64,
    pub buffers_reused: u64,
    pub cleanup_operations: u64,
}

/// Process-wide buffer pool.
pub struct BufferPool {
    inner: Mutex<Inner>,
    stats: PoolStats,
    max_idle: Duration,
}

fn next_pow2(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_max_idle(Duration::from_secs(POOL_DEFAULT_MAX_IDLE_SECS))
    }

    pub fn with_max_idle(max_idle: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner { buckets: HashMap::new(), last_cleanup: Instant::now() }),
            stats: PoolStats::default(),
            max_idle,
        }
    }

    /// Picks the smallest non-empty bucket `>= next_pow2(max(min_size, 1024))`,
    /// allocating a new buffer of that bucket size if none is available.
    pub fn acquire(self: &std::sync::Arc<Self>, min_size: usize) -> PooledBuffer {
        let bucket_size = next_pow2(min_size.max(POOL_MIN_BUCKET_SIZE));
        let mut inner = self.inner.lock();
        self.maybe_cleanup(&mut inner);

        let bytes = match inner.buckets.get_mut(&bucket_size).and_then(|b| b.entries.pop()) {
            Some(entry) => {
                self.stats.buffers_reused.fetch_add(1, Ordering::Relaxed);
                self.stats.available.fetch_sub(1, Ordering::Relaxed);
                entry.bytes
            }
            None => {
                self.stats.buffers_created.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_allocated.fetch_add(bucket_size as u64, Ordering::Relaxed);
                vec![0u8; bucket_size]
            }
        };
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        PooledBuffer { bytes: Some(bytes), bucket_size, pool: self.clone() }
    }

    fn release(&self, bucket_size: usize, bytes: Vec<u8>) {
        let mut inner = self.inner.lock();
        let bucket = inner.buckets.entry(bucket_size).or_insert_with(|| Bucket { entries: Vec::new() });
        if bucket.entries.len() < POOL_MAX_BUCKET_ENTRIES {
            bucket.entries.push(Entry { bytes, last_used: Instant::now() });
            self.stats.available.fetch_add(1, Ordering::Relaxed);
        } else {
            // Bucket is full: drop the buffer rather than let it grow
            // unbounded. `bytes_allocated` is not decremented, matching the
            // "acceptable-slightly-stale snapshot" statistics policy.
        }
        self.stats.total.fetch_sub(1, Ordering::Relaxed);
    }

    fn maybe_cleanup(&self, inner: &mut Inner) {
        let min_interval = Duration::from_secs(POOL_CLEANUP_MIN_INTERVAL_SECS);
        if inner.last_cleanup.elapsed() < min_interval {
            return;
        }
        self.cleanup_locked(inner, self.max_idle);
        inner.last_cleanup = Instant::now();
    }

    fn cleanup_locked(&self, inner: &mut Inner, max_idle: Duration) {
        let mut removed = 0u64;
        for bucket in inner.buckets.values_mut() {
            let before = bucket.entries.len();
            bucket.entries.retain(|e| e.last_used.elapsed() < max_idle);
            removed += (before - bucket.entries.len()) as u64;
        }
        if removed > 0 {
            self.stats.available.fetch_sub(removed, Ordering::Relaxed);
        }
        self.stats.cleanup_operations.fetch_add(1, Ordering::Relaxed);
    }

    /// Forces a cleanup pass regardless of the opportunistic interval,
    /// removing entries idle longer than `max_idle`. Exposed for tests and
    /// for a server's periodic diagnostics timer.
    pub fn cleanup(&self, max_idle: Duration) {
        let mut inner = self.inner.lock();
        self.cleanup_locked(&mut inner, max_idle);
        inner.last_cleanup = Instant::now();
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by [`BufferPool::acquire`]. Returns its buffer to the
/// pool on drop, unless the owning bucket is already at capacity.
pub struct PooledBuffer {
    bytes: Option<Vec<u8>>,
    bucket_size: usize,
    pool: std::sync::Arc<BufferPool>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.bytes.as_deref().expect("buffer taken before drop")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.bytes.as_deref_mut().expect("buffer taken before drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(bytes) = self.bytes.take() {
            self.pool.release(self.bucket_size, bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn acquire_rounds_up_to_next_pow2_bucket() {
        let pool = Arc::new(BufferPool::new());
        let buf = pool.acquire(100);
        assert_eq!(buf.len(), 1024);
    }

    #[test]
    fn acquire_respects_minimum_1024() {
        let pool = Arc::new(BufferPool::new());
        let buf = pool.acquire(1);
        assert_eq!(buf.len(), 1024);
    }

    #[test]
    fn released_buffer_is_reused() {
        let pool = Arc::new(BufferPool::new());
        {
            let _buf = pool.acquire(2000);
        }
        let stats_before = pool.stats();
        assert_eq!(stats_before.buffers_created, 1);
        let _buf2 = pool.acquire(2000);
        let stats_after = pool.stats();
        assert_eq!(stats_after.buffers_created, 1);
        assert_eq!(stats_after.buffers_reused, 1);
    }

    #[test]
    fn bucket_beyond_capacity_drops_buffer() {
        let pool = Arc::new(BufferPool::new());
        let mut bufs = Vec::new();
        for _ in 0..(POOL_MAX_BUCKET_ENTRIES + 10) {
            bufs.push(pool.acquire(1024));
        }
        drop(bufs);
        let stats = pool.stats();
        assert!(stats.available as usize <= POOL_MAX_BUCKET_ENTRIES);
    }

    #[test]
    fn cleanup_evicts_idle_entries() {
        let pool = Arc::new(BufferPool::new());
        {
            let _buf = pool.acquire(1024);
        }
        assert_eq!(pool.stats().available, 1);
        pool.cleanup(Duration::from_secs(0));
        assert_eq!(pool.stats().available, 0);
    }
}
