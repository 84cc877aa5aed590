//! Serialization cache.
//!
//! Encoding the same AppendEntries heartbeat for every follower on every
//! tick is pure waste; the client caches encoded payloads keyed by a hash
//! of the RPC kind and its fields. The cache is LRU-bounded so a stream
//! of distinct requests cannot grow it without limit.

use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::rpc::RpcKind;

/// Cache key: RPC kind plus a hash of the request fields.
pub fn cache_key<T: Hash>(kind: RpcKind, request: &T) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    kind.hash(&mut hasher);
    request.hash(&mut hasher);
    hasher.finish()
}

/// LRU cache of encoded RPC payloads.
pub struct SerializationCache {
    entries: LruCache<u64, Arc<Vec<u8>>>,
    hits: u64,
    misses: u64,
}

impl SerializationCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1");
        Self {
            entries: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, key: u64) -> Option<Arc<Vec<u8>>> {
        match self.entries.get(&key) {
            Some(bytes) => {
                self.hits += 1;
                Some(Arc::clone(bytes))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: u64, bytes: Vec<u8>) -> Arc<Vec<u8>> {
        let bytes = Arc::new(bytes);
        self.entries.put(key, Arc::clone(&bytes));
        bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_after_insert() {
        let mut cache = SerializationCache::new(4);
        let key = 17u64;
        assert!(cache.get(key).is_none());
        cache.insert(key, b"payload".to_vec());
        assert_eq!(cache.get(key).unwrap().as_slice(), b"payload");
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn capacity_is_bounded_lru() {
        let mut cache = SerializationCache::new(2);
        cache.insert(1, vec![1]);
        cache.insert(2, vec![2]);
        // Touch key 1 so key 2 is the LRU victim.
        cache.get(1);
        cache.insert(3, vec![3]);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn distinct_requests_get_distinct_keys() {
        #[derive(Hash)]
        struct Req {
            term: u64,
        }
        let a = cache_key(RpcKind::AppendEntries, &Req { term: 1 });
        let b = cache_key(RpcKind::AppendEntries, &Req { term: 2 });
        let c = cache_key(RpcKind::RequestVote, &Req { term: 1 });
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
