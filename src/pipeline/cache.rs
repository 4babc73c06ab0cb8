//! Content-addressed build cache with LRU eviction (`spec.md` §3, §4.4).

use crate::types::CacheEntry;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::RwLock;

/// Compute the cache key for a component build: a hash of its content hash,
/// parameter-list hash, toolchain version, and canonical build flags.
pub fn cache_key(
    content_hash: &str,
    parameter_list_hash: &str,
    toolchain_version: &str,
    build_flags: &[String],
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(content_hash.as_bytes());
    hasher.update(b"\0");
    hasher.update(parameter_list_hash.as_bytes());
    hasher.update(b"\0");
    hasher.update(toolchain_version.as_bytes());
    for flag in build_flags {
        hasher.update(b"\0");
        hasher.update(flag.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

pub struct BuildCache {
    entries: RwLock<LruCache<String, CacheEntry>>,
    toolchain_version: String,
}

impl BuildCache {
    pub fn new(capacity: usize, toolchain_version: impl Into<String>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
            toolchain_version: toolchain_version.into(),
        }
    }

    /// A cache hit is only valid if its `toolchain_version` matches the
    /// current one — stale entries from a previous compiler build are
    /// treated as a miss, per `spec.md` §3 invariant.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut entries = self.entries.write().expect("cache poisoned");
        let entry = entries.get(key)?.clone();
        if entry.toolchain_version != self.toolchain_version {
            entries.pop(key);
            return None;
        }
        Some(entry)
    }

    pub fn insert(&self, key: String, entry: CacheEntry) {
        self.entries.write().expect("cache poisoned").put(key, entry);
    }

    pub fn clear(&self) {
        self.entries.write().expect("cache poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a corrupt entry so the next lookup misses and the build is
    /// retried, per the `CacheCorrupt` recovery policy in `spec.md` §4.4.
    pub fn evict(&self, key: &str) {
        self.entries.write().expect("cache poisoned").pop(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: &str, version: &str) -> CacheEntry {
        CacheEntry {
            artifact_hash: hash.to_string(),
            toolchain_version: version.to_string(),
            compiled_at: std::time::SystemTime::now(),
        }
    }

    #[test]
    fn hit_then_miss_on_content_change() {
        let key1 = cache_key("content-a", "params-a", "v1", &[]);
        let key2 = cache_key("content-b", "params-a", "v1", &[]);
        assert_ne!(key1, key2);

        let cache = BuildCache::new(4, "v1");
        cache.insert(key1.clone(), entry("artifact-1", "v1"));
        assert!(cache.get(&key1).is_some());
        assert!(cache.get(&key2).is_none());
    }

    #[test]
    fn stale_toolchain_version_is_a_miss() {
        let cache = BuildCache::new(4, "v2");
        let key = cache_key("content-a", "params-a", "v1", &[]);
        cache.insert(key.clone(), entry("artifact-1", "v1"));
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn lru_evicts_least_recently_used_under_capacity() {
        let cache = BuildCache::new(2, "v1");
        cache.insert("a".into(), entry("ha", "v1"));
        cache.insert("b".into(), entry("hb", "v1"));
        cache.get("a"); // touch a, making b the LRU victim
        cache.insert("c".into(), entry("hc", "v1"));
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }
}
