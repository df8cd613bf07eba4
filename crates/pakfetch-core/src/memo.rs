//! In-memory caches shared across requests in a session.

use crate::manifest::Packument;
use lru::LruCache;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

/// How long a git ref listing stays fresh.
pub const GIT_REFS_TTL: Duration = Duration::from_secs(5 * 60);

/// Packuments kept in memory per session.
pub const PACKUMENT_CAPACITY: usize = 100;

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A map whose entries expire a fixed time after insertion.
pub struct TtlCache<K, V> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<K, (SystemTime, V)>>,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    #[must_use]
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The live value for `key`, dropping it if expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some((inserted, value)) if !self.expired(*inserted, now) => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let now = self.clock.now();
        let mut entries = self.lock();
        entries.retain(|_, (inserted, _)| !self.expired(*inserted, now));
        entries.insert(key, (now, value));
    }

    pub fn remove(&self, key: &K) {
        self.lock().remove(key);
    }

    fn expired(&self, inserted: SystemTime, now: SystemTime) -> bool {
        now.duration_since(inserted).unwrap_or_default() >= self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, (SystemTime, V)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

/// Bounded LRU of parsed packuments keyed by request URL.
pub struct PackumentCache {
    entries: Mutex<LruCache<String, Arc<Packument>>>,
}

impl PackumentCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    #[must_use]
    pub fn get(&self, url: &str) -> Option<Arc<Packument>> {
        self.lock().get(url).cloned()
    }

    pub fn insert(&self, url: String, packument: Arc<Packument>) {
        self.lock().put(url, packument);
    }

    pub fn remove(&self, url: &str) {
        self.lock().pop(url);
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, Arc<Packument>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PackumentCache {
    fn default() -> Self {
        Self::new(PACKUMENT_CAPACITY)
    }
}

impl fmt::Debug for PackumentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackumentCache")
            .field("len", &self.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_expiry_with_manual_clock() {
        let clock = ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000));
        let cache: TtlCache<String, u32> = TtlCache::new(GIT_REFS_TTL, Arc::new(clock.clone()));
        cache.insert("repo".into(), 7);

        clock.advance(Duration::from_secs(299));
        assert_eq!(cache.get(&"repo".to_string()), Some(7));

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get(&"repo".to_string()), None);
    }

    #[test]
    fn test_ttl_keys_are_independent() {
        let cache: TtlCache<String, u32> = TtlCache::new(GIT_REFS_TTL, Arc::new(SystemClock));
        cache.insert("a".into(), 1);
        cache.insert("b".into(), 2);
        cache.remove(&"a".to_string());
        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(cache.get(&"b".to_string()), Some(2));
    }

    #[test]
    fn test_packument_lru_evicts_oldest() {
        let cache = PackumentCache::new(2);
        for name in ["a", "b", "c"] {
            cache.insert(
                name.to_string(),
                Arc::new(Packument {
                    name: name.to_string(),
                    ..Packument::default()
                }),
            );
        }
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("c").unwrap().name, "c");
        cache.remove("c");
        assert!(cache.get("c").is_none());
    }
}
