//! # In-Process TTL Cache
//!
//! Thin wrapper over `cached`'s [`TimedCache`] exposing atomic get/put with
//! TTL eviction, used for the read-heavy application and flow-definition
//! lookups. A disabled cache is a no-op, so call sites never branch on the
//! `cache.disabled` setting themselves.

use std::hash::Hash;
use std::sync::Mutex;

use cached::stores::TimedCache;
use cached::Cached;

use crate::config::CacheConfig;

/// Atomic get/put cache with per-entry TTL.
pub struct TtlCache<K, V> {
    inner: Option<Mutex<TimedCache<K, V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Builds a cache from the `cache` configuration section.
    pub fn from_config(config: &CacheConfig) -> Self {
        if config.disabled {
            return Self { inner: None };
        }
        Self {
            inner: Some(Mutex::new(TimedCache::with_lifespan_and_capacity(
                config.ttl,
                config.size,
            ))),
        }
    }

    /// A cache with an explicit TTL, mainly for tests.
    pub fn with_ttl(ttl_seconds: u64, capacity: usize) -> Self {
        Self {
            inner: Some(Mutex::new(TimedCache::with_lifespan_and_capacity(
                ttl_seconds,
                capacity,
            ))),
        }
    }

    /// Returns a clone of the cached value when present and unexpired.
    pub fn get(&self, key: &K) -> Option<V> {
        let inner = self.inner.as_ref()?;
        let mut guard = inner.lock().ok()?;
        guard.cache_get(key).cloned()
    }

    /// Stores a value under `key`.
    pub fn put(&self, key: K, value: V) {
        if let Some(inner) = &self.inner {
            if let Ok(mut guard) = inner.lock() {
                guard.cache_set(key, value);
            }
        }
    }

    /// Drops a cached entry, forcing the next read through to the store.
    pub fn invalidate(&self, key: &K) {
        if let Some(inner) = &self.inner {
            if let Ok(mut guard) = inner.lock() {
                guard.cache_remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_after_put_returns_value() {
        let cache: TtlCache<String, i32> = TtlCache::with_ttl(60, 16);
        cache.put("a".into(), 1);
        assert_eq!(cache.get(&"a".into()), Some(1));
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache: TtlCache<String, i32> = TtlCache::with_ttl(60, 16);
        cache.put("a".into(), 1);
        cache.invalidate(&"a".into());
        assert_eq!(cache.get(&"a".into()), None);
    }

    #[test]
    fn disabled_cache_is_a_no_op() {
        let mut config = crate::config::AppConfig::defaults().unwrap().cache;
        config.disabled = true;
        let cache: TtlCache<String, i32> = TtlCache::from_config(&config);
        cache.put("a".into(), 1);
        assert_eq!(cache.get(&"a".into()), None);
    }
}
