//! # Query & Join Caches
//!
//! Per-namespace LRU caches keyed by query signature. Entries carry the
//! namespace version (a counter bumped by every write) they were computed
//! at; a version mismatch is a miss, so no explicit invalidation sweep is
//! needed.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::types::IdType;

#[derive(Debug, Clone)]
pub struct CachedIds {
    pub ids: Vec<IdType>,
    pub total: usize,
    pub version: u64,
}

pub struct QueryCache {
    inner: Mutex<LruCache<String, CachedIds>>,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn get(&self, signature: &str, version: u64) -> Option<CachedIds> {
        let mut cache = self.inner.lock();
        match cache.get(signature) {
            Some(hit) if hit.version == version => Some(hit.clone()),
            Some(_) => {
                cache.pop(signature);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, signature: String, entry: CachedIds) {
        self.inner.lock().put(signature, entry);
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// Key of one cached join sub-select: right namespace, right query
/// signature, left key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JoinCacheKey {
    pub ns: String,
    pub signature: String,
    pub key: String,
}

pub struct JoinCache {
    inner: Mutex<LruCache<JoinCacheKey, CachedIds>>,
}

impl JoinCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn get(&self, key: &JoinCacheKey, version: u64) -> Option<CachedIds> {
        let mut cache = self.inner.lock();
        match cache.get(key) {
            Some(hit) if hit.version == version => Some(hit.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: JoinCacheKey, entry: CachedIds) {
        self.inner.lock().put(key, entry);
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_mismatch_is_a_miss() {
        let cache = QueryCache::new(4);
        cache.put(
            "q1".to_string(),
            CachedIds {
                ids: vec![1, 2],
                total: 2,
                version: 7,
            },
        );
        assert!(cache.get("q1", 7).is_some());
        assert!(cache.get("q1", 8).is_none());
        // The stale entry is evicted on the failed read.
        assert!(cache.get("q1", 7).is_none());
    }

    #[test]
    fn lru_evicts_oldest() {
        let cache = QueryCache::new(2);
        for i in 0..3 {
            cache.put(
                format!("q{i}"),
                CachedIds {
                    ids: vec![],
                    total: 0,
                    version: 1,
                },
            );
        }
        assert!(cache.get("q0", 1).is_none());
        assert!(cache.get("q2", 1).is_some());
    }
}
