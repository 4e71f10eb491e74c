use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::model::{CacheEntry, CacheEntryState};

pub const CACHE_TTL: Duration = Duration::from_secs(10 * 60);
pub const MAX_CACHE_ITEMS: usize = 200;
const SOFT_MAX_ENTRIES: usize = 300;
const MAX_EVICTIONS_PER_SWEEP: usize = 100;

/// Process-wide map of cache entries keyed by `(query, sources)`. Creation
/// and eviction are serialized by a single lock; once an entry exists,
/// mutation happens through its own lock instead (see `model::CacheEntryState`).
pub struct QueryCache {
    entries: Mutex<HashMap<String, Arc<CacheEntry>>>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the entry for `key`, creating it if absent. Opportunistically
    /// evicts a bounded number of expired, unlocked entries once the map
    /// grows past the soft cap.
    pub async fn get_or_create(&self, key: &str) -> Arc<CacheEntry> {
        let mut guard = self.entries.lock().await;
        if let Some(entry) = guard.get(key) {
            return entry.clone();
        }
        let now = Instant::now();
        let entry = Arc::new(CacheEntry {
            key: key.to_string(),
            lock: Mutex::new(CacheEntryState::fresh(now, CACHE_TTL)),
        });
        guard.insert(key.to_string(), entry.clone());

        if guard.len() > SOFT_MAX_ENTRIES {
            let mut evicted = 0;
            let candidates: Vec<String> = guard
                .iter()
                .filter_map(|(k, v)| {
                    if Arc::strong_count(v) == 1 {
                        v.lock.try_lock().ok().map(|state| (k.clone(), state.expires_at))
                    } else {
                        None
                    }
                })
                .filter(|(_, expires_at)| *expires_at <= now)
                .map(|(k, _)| k)
                .collect();
            for k in candidates {
                if evicted >= MAX_EVICTIONS_PER_SWEEP {
                    break;
                }
                guard.remove(&k);
                evicted += 1;
            }
            if evicted > 0 {
                debug!("query cache: evicted {} expired entries", evicted);
            }
        }
        entry
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_returns_same_entry() {
        let cache = QueryCache::new();
        let a = cache.get_or_create("iphone|market.yandex.ru").await;
        let b = cache.get_or_create("iphone|market.yandex.ru").await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn distinct_keys_create_distinct_entries() {
        let cache = QueryCache::new();
        let a = cache.get_or_create("iphone|market.yandex.ru").await;
        let b = cache.get_or_create("ipad|market.yandex.ru").await;
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn fresh_entry_state_matches_reset_invariant() {
        let cache = QueryCache::new();
        let entry = cache.get_or_create("iphone|market.yandex.ru").await;
        let state = entry.lock.lock().await;
        assert!(state.items.is_empty());
        assert!(state.seen.is_empty());
        assert!(state.pending_sources.is_empty());
        assert_eq!(state.yandex_next_page, 1);
    }
}
