use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::clock::SharedClock;

struct CachedEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// Keyed cache of expensive-to-build clients with a fixed time-to-live.
///
/// Entries are never refreshed on read: a client built at `t` is served until
/// `t + ttl` and rebuilt afterwards. Expired entries are dropped lazily on
/// lookup and eagerly by [`ClientCache::evict`].
pub struct ClientCache<V> {
    entries: Mutex<FxHashMap<String, CachedEntry<V>>>,
    ttl: Duration,
    clock: SharedClock,
}

impl<V: Clone> ClientCache<V> {
    #[must_use]
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            ttl,
            clock,
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Return the live entry for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if now.duration_since(entry.inserted_at) < self.ttl => {
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Return the live entry for `key`, building and caching it on a miss.
    ///
    /// # Errors
    ///
    /// Propagates the builder's error; nothing is cached in that case.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: &str,
        build: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = build()?;
        let inserted_at = self.clock.now();
        let mut entries = self.entries.lock();
        // Another caller may have raced us here; keep whichever is live.
        if let Some(existing) = entries.get(key) {
            if inserted_at.duration_since(existing.inserted_at) < self.ttl {
                return Ok(existing.value.clone());
            }
        }
        entries.insert(
            key.to_string(),
            CachedEntry {
                value: value.clone(),
                inserted_at,
            },
        );
        Ok(value)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn evict(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.ttl;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.inserted_at) < ttl);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl<V: Clone + Send + 'static> ClientCache<V> {
    /// Run [`ClientCache::evict`] every `interval` until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.evict();
                if removed > 0 {
                    debug!(removed, remaining = cache.len(), "client cache sweep");
                }
            }
        })
    }
}

/// Cache key for one endpoint plus the header values that shape the client.
#[must_use]
pub fn cache_key(endpoint: &str, headers: &http::HeaderMap) -> String {
    let mut pairs: Vec<(&str, &[u8])> = headers
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_bytes()))
        .collect();
    pairs.sort_unstable();
    let mut key = String::with_capacity(endpoint.len() + pairs.len() * 24);
    key.push_str(endpoint);
    for (name, value) in pairs {
        key.push('\n');
        key.push_str(name);
        key.push(':');
        key.push_str(&String::from_utf8_lossy(value));
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache(ttl_secs: u64) -> (ClientCache<u32>, ManualClock) {
        let clock = ManualClock::new();
        (
            ClientCache::new(Duration::from_secs(ttl_secs), Arc::new(clock.clone())),
            clock,
        )
    }

    #[test]
    fn test_hit_within_ttl() {
        let (cache, clock) = cache(10);
        let mut builds = 0;
        for _ in 0..3 {
            let value = cache
                .get_or_try_insert_with("a", || {
                    builds += 1;
                    Ok::<_, ()>(7)
                })
                .unwrap();
            assert_eq!(value, 7);
            clock.advance(Duration::from_secs(3));
        }
        assert_eq!(builds, 1);
    }

    #[test]
    fn test_rebuild_after_ttl() {
        let (cache, clock) = cache(10);
        cache.get_or_try_insert_with("a", || Ok::<_, ()>(1)).unwrap();
        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.get("a"), None);
        let value = cache.get_or_try_insert_with("a", || Ok::<_, ()>(2)).unwrap();
        assert_eq!(value, 2);
    }

    #[test]
    fn test_builder_error_is_not_cached() {
        let (cache, _clock) = cache(10);
        let result = cache.get_or_try_insert_with("a", || Err::<u32, _>("boom"));
        assert_eq!(result, Err("boom"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evict_only_expired() {
        let (cache, clock) = cache(10);
        cache.get_or_try_insert_with("old", || Ok::<_, ()>(1)).unwrap();
        clock.advance(Duration::from_secs(6));
        cache.get_or_try_insert_with("new", || Ok::<_, ()>(2)).unwrap();
        clock.advance(Duration::from_secs(5));
        assert_eq!(cache.evict(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("new"), Some(2));
    }

    #[test]
    fn test_cache_key_is_order_independent() {
        let mut a = http::HeaderMap::new();
        a.insert("x-one", http::HeaderValue::from_static("1"));
        a.insert("x-two", http::HeaderValue::from_static("2"));
        let mut b = http::HeaderMap::new();
        b.insert("x-two", http::HeaderValue::from_static("2"));
        b.insert("x-one", http::HeaderValue::from_static("1"));
        assert_eq!(cache_key("https://api", &a), cache_key("https://api", &b));
        assert_ne!(cache_key("https://api", &a), cache_key("https://other", &a));
    }

    #[tokio::test]
    async fn test_sweeper_stops_when_cache_dropped() {
        let (cache, _clock) = cache(1);
        let cache = Arc::new(cache);
        let handle = cache.spawn_sweeper(Duration::from_millis(5));
        drop(cache);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("sweeper exits")
            .unwrap();
    }
}
