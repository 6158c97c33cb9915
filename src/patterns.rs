//! Bounded caches for compiled patterns.
//!
//! Regexes, JSONPath queries, JSON schemas and expression ASTs are compiled
//! on first use and reused across requests. Each cache holds at most
//! `capacity` entries and evicts the least recently used one when full.

use jsonpath_rust::JsonPath;
use jsonschema::Validator;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tracing::trace;

/// Default number of entries per cache.
pub const DEFAULT_CAPACITY: usize = 100;

struct CacheEntry<V> {
    value: V,
    last_used: u64,
}

struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    clock: u64,
}

/// Thread-safe LRU cache keyed by source text.
pub struct PatternCache<K, V> {
    capacity: usize,
    state: Mutex<CacheState<K, V>>,
}

impl<K, V> PatternCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                clock: 0,
            }),
        }
    }

    /// Return the cached value for `key`, compiling and inserting it on a miss.
    ///
    /// Compilation runs outside the lock; two requests racing on the same
    /// key may both compile, and the later insert wins.
    pub fn get_or_try_insert<Q, E, F>(&self, key: &Q, compile: F) -> Result<V, E>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
        F: FnOnce() -> Result<V, E>,
    {
        {
            let mut state = self.state.lock();
            state.clock += 1;
            let now = state.clock;
            if let Some(entry) = state.entries.get_mut(key) {
                entry.last_used = now;
                return Ok(entry.value.clone());
            }
        }

        let value = compile()?;
        if self.capacity == 0 {
            return Ok(value);
        }

        let mut state = self.state.lock();
        if state.entries.len() >= self.capacity && !state.entries.contains_key(key) {
            Self::evict_lru(&mut state);
        }
        state.clock += 1;
        let now = state.clock;
        state.entries.insert(
            key.to_owned(),
            CacheEntry {
                value: value.clone(),
                last_used: now,
            },
        );
        Ok(value)
    }

    fn evict_lru(state: &mut CacheState<K, V>) {
        let oldest = state
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            state.entries.remove(&key);
            trace!("Evicted least recently used pattern");
        }
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.state.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }
}

/// Compiled-pattern context shared by every request.
///
/// Built once at startup and passed by reference into the matcher.
pub struct CompiledPatterns {
    regex: PatternCache<String, Regex>,
    regex_ci: PatternCache<String, Regex>,
    json_paths: PatternCache<String, Arc<JsonPath>>,
    schemas: PatternCache<String, Arc<Validator>>,
}

impl CompiledPatterns {
    pub fn new(capacity: usize) -> Self {
        Self {
            regex: PatternCache::new(capacity),
            regex_ci: PatternCache::new(capacity),
            json_paths: PatternCache::new(capacity),
            schemas: PatternCache::new(capacity),
        }
    }

    /// Compiled regex for `pattern`. Case-sensitive and case-insensitive
    /// variants are cached separately.
    pub fn regex(&self, pattern: &str, case_insensitive: bool) -> Result<Regex, regex::Error> {
        let cache = if case_insensitive {
            &self.regex_ci
        } else {
            &self.regex
        };
        cache.get_or_try_insert(pattern, || {
            regex::RegexBuilder::new(pattern)
                .case_insensitive(case_insensitive)
                .build()
        })
    }

    /// Compiled JSONPath query.
    pub fn json_path(&self, expression: &str) -> Result<Arc<JsonPath>, String> {
        self.json_paths.get_or_try_insert(expression, || {
            let path: JsonPath = JsonPath::try_from(expression).map_err(|e| e.to_string())?;
            Ok(Arc::new(path))
        })
    }

    /// Compiled JSON schema validator, keyed by the schema's serialized form.
    pub fn schema(&self, schema: &Value) -> Result<Arc<Validator>, String> {
        let key = schema.to_string();
        self.schemas.get_or_try_insert(key.as_str(), || {
            jsonschema::validator_for(schema)
                .map(Arc::new)
                .map_err(|e| e.to_string())
        })
    }
}

impl Default for CompiledPatterns {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
