//! Optional response cache.
//!
//! Rendered responses are cached by path and sorted query string. The
//! engine never depends on the cache for correctness.

use crate::render::MockResponse;
use crate::request::RequestSnapshot;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::trace;

/// Key/value store for rendered responses.
pub trait ResponseCache: Send + Sync {
    fn get(&self, key: &str) -> Option<MockResponse>;

    fn set(&self, key: &str, value: MockResponse, ttl: Duration);
}

/// `path?k=v&k=v` with pairs sorted by key then value.
pub fn cache_key(snapshot: &RequestSnapshot) -> String {
    format!("{}?{}", snapshot.path(), snapshot.query().sorted_query_string())
}

struct CacheEntry {
    value: MockResponse,
    expires_at: Instant,
    last_used: u64,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    clock: u64,
}

/// In-process cache with per-entry TTL and least-recently-used eviction.
pub struct InMemoryResponseCache {
    max_entries: usize,
    state: Mutex<CacheState>,
}

impl InMemoryResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                clock: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn make_room(state: &mut CacheState, max_entries: usize) {
        let now = Instant::now();
        state.entries.retain(|_, entry| entry.expires_at > now);

        while state.entries.len() >= max_entries {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    state.entries.remove(&key);
                    trace!(key = %key, "Evicted cached response");
                }
                None => break,
            }
        }
    }
}

impl ResponseCache for InMemoryResponseCache {
    fn get(&self, key: &str) -> Option<MockResponse> {
        let mut state = self.state.lock();
        state.clock += 1;
        let tick = state.clock;

        let expired = state.entries.get(key)?.expires_at <= Instant::now();
        if expired {
            state.entries.remove(key);
            return None;
        }
        let entry = state.entries.get_mut(key)?;
        entry.last_used = tick;
        Some(entry.value.clone())
    }

    fn set(&self, key: &str, value: MockResponse, ttl: Duration) {
        if self.max_entries == 0 || ttl.is_zero() {
            return;
        }

        let mut state = self.state.lock();
        if !state.entries.contains_key(key) {
            Self::make_room(&mut state, self.max_entries);
        }
        state.clock += 1;
        let tick = state.clock;
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
                last_used: tick,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(n: u64) -> MockResponse {
        MockResponse::json(200, &json!({ "n": n }))
    }

    #[test]
    fn test_cache_key_sorts_query() {
        let snapshot = RequestSnapshot::builder("GET", "/items")
            .query_string("b=2&a=1&a=0")
            .build();
        assert_eq!(cache_key(&snapshot), "/items?a=0&a=1&b=2");

        let bare = RequestSnapshot::builder("GET", "/items").build();
        assert_eq!(cache_key(&bare), "/items?");
    }

    #[test]
    fn test_get_and_set() {
        let cache = InMemoryResponseCache::new(4);
        assert!(cache.get("/a?").is_none());

        cache.set("/a?", response(1), Duration::from_secs(60));
        assert_eq!(cache.get("/a?"), Some(response(1)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_set_and_get() {
        let cache = InMemoryResponseCache::new(8);

        std::thread::scope(|scope| {
            for worker in 0..8u64 {
                let cache = &cache;
                scope.spawn(move || {
                    for i in 0..200u64 {
                        let n = (i + worker) % 16;
                        let key = format!("/items/{n}?");
                        cache.set(&key, response(n), Duration::from_secs(60));
                        if let Some(hit) = cache.get(&key) {
                            assert_eq!(hit, response(n));
                        }
                        assert!(cache.len() <= 8);
                    }
                });
            }
        });

        assert_eq!(cache.len(), 8);
    }

    #[test]
    fn test_entries_expire() {
        let cache = InMemoryResponseCache::new(4);
        cache.set("/a?", response(1), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(30));

        assert!(cache.get("/a?").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = InMemoryResponseCache::new(2);
        let ttl = Duration::from_secs(60);

        cache.set("a", response(1), ttl);
        cache.set("b", response(2), ttl);
        cache.get("a");
        cache.set("c", response(3), ttl);

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_disabled_sizes() {
        let cache = InMemoryResponseCache::new(0);
        cache.set("a", response(1), Duration::from_secs(60));
        assert!(cache.get("a").is_none());

        let cache = InMemoryResponseCache::new(2);
        cache.set("a", response(1), Duration::ZERO);
        assert!(cache.get("a").is_none());
    }
}
