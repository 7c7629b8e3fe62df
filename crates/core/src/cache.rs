//! Bounded LRU cache whose entries expire after a TTL.
//!
//! Every bounded cache in the engine (query results, query embeddings, file
//! contents) is one of these. Expiration is lazy: an entry older than the TTL
//! is dropped on the read that finds it, never by a background sweep.

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

struct TimedEntry<V> {
    value: V,
    inserted: Instant,
}

/// LRU cache with per-entry insertion timestamps and a shared TTL.
pub struct TimedLru<K: Hash + Eq, V> {
    inner: LruCache<K, TimedEntry<V>>,
    ttl: Duration,
}

impl<K: Hash + Eq, V> TimedLru<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self { inner: LruCache::new(cap), ttl }
    }

    /// Look up `key`, dropping the entry (and missing) if it has expired.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let expired = match self.inner.peek(key) {
            Some(entry) => entry.inserted.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            self.inner.pop(key);
            return None;
        }
        self.inner.get(key).map(|entry| &entry.value)
    }

    pub fn put(&mut self, key: K, value: V) {
        self.inner.put(key, TimedEntry { value, inserted: Instant::now() });
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.pop(key).map(|entry| entry.value)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Shrink the capacity, evicting least-recently-used entries as needed.
    /// Used by the memory-pressure monitor.
    pub fn shrink_to(&mut self, capacity: usize) {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        self.inner.resize(cap);
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = ttl;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let mut cache: TimedLru<String, u32> = TimedLru::new(4, Duration::from_secs(60));
        cache.put("a".to_string(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(&1));
        assert_eq!(cache.get(&"b".to_string()), None);
    }

    #[test]
    fn test_capacity_eviction() {
        let mut cache: TimedLru<u32, u32> = TimedLru::new(2, Duration::from_secs(60));
        cache.put(1, 1);
        cache.put(2, 2);
        cache.put(3, 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&3), Some(&3));
    }

    #[test]
    fn test_ttl_expiry_is_lazy() {
        let mut cache: TimedLru<u32, u32> = TimedLru::new(4, Duration::from_millis(0));
        cache.put(1, 1);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_shrink_evicts_lru() {
        let mut cache: TimedLru<u32, u32> = TimedLru::new(4, Duration::from_secs(60));
        for i in 0..4 {
            cache.put(i, i);
        }
        cache.get(&0);
        cache.shrink_to(2);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&0), Some(&0));
    }
}
