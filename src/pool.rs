//! Small object pools for the allocations that sit in the hot path of the
//! watcher and build pipeline.
//!
//! Per `spec.md` §9 ("Pooling"): only objects in the `[1 KiB, 64 KiB]`
//! working-set band are worth pooling. Smaller allocations are cheaper left
//! to the allocator; larger ones are rare and should just be freed. Each
//! `BytePool` enforces that band on return — `recycle` silently drops any
//! buffer whose capacity falls outside it instead of growing the pool with
//! an outlier.

use std::sync::Mutex;

/// A simple capacity-bounded free-list of `Vec<u8>` buffers.
pub struct BytePool {
    min_bytes: usize,
    max_bytes: usize,
    initial_bytes: usize,
    shelf: Mutex<Vec<Vec<u8>>>,
    shelf_capacity: usize,
}

impl BytePool {
    pub fn new(min_bytes: usize, max_bytes: usize, initial_bytes: usize) -> Self {
        Self {
            min_bytes,
            max_bytes,
            initial_bytes,
            shelf: Mutex::new(Vec::new()),
            shelf_capacity: 64,
        }
    }

    /// Take a buffer from the shelf, or allocate a fresh one at
    /// `initial_bytes` capacity.
    pub fn acquire(&self) -> Vec<u8> {
        let mut shelf = self.shelf.lock().expect("byte pool poisoned");
        shelf
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.initial_bytes))
    }

    /// Return a buffer for reuse. Buffers outside `[min_bytes, max_bytes]`
    /// are dropped rather than recycled, and the shelf itself is bounded so
    /// a burst of one-off large buffers can't pin memory indefinitely.
    pub fn recycle(&self, mut buf: Vec<u8>) {
        let cap = buf.capacity();
        if cap < self.min_bytes || cap > self.max_bytes {
            return;
        }
        buf.clear();
        let mut shelf = self.shelf.lock().expect("byte pool poisoned");
        if shelf.len() < self.shelf_capacity {
            shelf.push(buf);
        }
    }
}

/// A capacity-bounded free-list of `Vec<T>` buffers, for allocations that
/// don't fit `BytePool`'s byte-oriented band check — e.g. the watcher's
/// per-batch `Vec<ChangeEvent>`, which is reused across flush cycles instead
/// of reallocated every time.
pub struct VecPool<T> {
    shelf: Mutex<Vec<Vec<T>>>,
    shelf_capacity: usize,
}

impl<T> VecPool<T> {
    pub fn new(shelf_capacity: usize) -> Self {
        Self {
            shelf: Mutex::new(Vec::new()),
            shelf_capacity,
        }
    }

    /// Take a buffer from the shelf, or allocate a fresh empty one.
    pub fn acquire(&self) -> Vec<T> {
        self.shelf.lock().expect("vec pool poisoned").pop().unwrap_or_default()
    }

    /// Return a buffer for reuse, clearing it first.
    pub fn release(&self, mut buf: Vec<T>) {
        buf.clear();
        let mut shelf = self.shelf.lock().expect("vec pool poisoned");
        if shelf.len() < self.shelf_capacity {
            shelf.push(buf);
        }
    }
}

/// One `BytePool` per worker, so workers never contend on the same lock.
pub struct ShardedBytePool {
    shards: Vec<BytePool>,
}

impl ShardedBytePool {
    pub fn new(shard_count: usize, min_bytes: usize, max_bytes: usize, initial_bytes: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| BytePool::new(min_bytes, max_bytes, initial_bytes))
            .collect();
        Self { shards }
    }

    pub fn shard(&self, worker_index: usize) -> &BytePool {
        &self.shards[worker_index % self.shards.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycles_buffers_within_band() {
        let pool = BytePool::new(1024, 64 * 1024, 4096);
        let buf = pool.acquire();
        assert!(buf.capacity() >= 4096);
        let mut buf = Vec::with_capacity(8192);
        buf.extend_from_slice(b"hello");
        pool.recycle(buf);
        let reused = pool.acquire();
        assert_eq!(reused.capacity(), 8192);
        assert!(reused.is_empty());
    }

    #[test]
    fn discards_outlier_capacities() {
        let pool = BytePool::new(1024, 64 * 1024, 4096);
        pool.recycle(Vec::with_capacity(16));
        pool.recycle(Vec::with_capacity(128 * 1024));
        // Neither the too-small nor too-large buffer should have been kept.
        let acquired = pool.acquire();
        assert_eq!(acquired.capacity(), 4096);
    }

    #[test]
    fn vec_pool_reuses_released_capacity() {
        let pool: VecPool<u64> = VecPool::new(4);
        let mut buf = pool.acquire();
        buf.extend([1, 2, 3]);
        let cap = buf.capacity();
        pool.release(buf);
        let reused = pool.acquire();
        assert!(reused.is_empty());
        assert_eq!(reused.capacity(), cap);
    }

    #[test]
    fn sharded_pool_indexes_by_worker() {
        let pool = ShardedBytePool::new(4, 1024, 64 * 1024, 4096);
        let a = pool.shard(0) as *const BytePool;
        let b = pool.shard(4) as *const BytePool;
        assert_eq!(a, b);
    }
}
