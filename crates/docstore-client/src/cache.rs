//! In-memory read cache.
//!
//! Three tiers, each keyed first by entity type:
//!
//! ```text
//! objects      type -> id -> Promise<Document>     (in-flight and settled fetches)
//! id_searches  type -> LRU(search hash -> [id])
//! aggregates   type -> LRU(pipeline hash -> [row])
//! ```
//!
//! Entries are advisory: a miss only costs a network call. Per-type maps are
//! created on first use and dropped wholesale on invalidation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::deferred::Promise;
use crate::types::Document;

type Lru<V> = Cache<String, Arc<V>>;

/// Default entries per type in the search and aggregate tiers.
pub const DEFAULT_CAPACITY: u64 = 1000;

/// Entry-bounded tier that evicts the least recently used key.
fn lru<V: Send + Sync + 'static>(capacity: u64) -> Lru<V> {
    Cache::builder()
        .max_capacity(capacity)
        .eviction_policy(EvictionPolicy::lru())
        .build()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hit/miss counters.
#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

pub struct ReadCache {
    objects: Mutex<HashMap<String, HashMap<String, Promise<Document>>>>,
    id_searches: Mutex<HashMap<String, Lru<Vec<String>>>>,
    aggregates: Mutex<HashMap<String, Lru<Vec<Value>>>>,
    capacity: u64,
    counters: Counters,
}

impl ReadCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            id_searches: Mutex::new(HashMap::new()),
            aggregates: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            counters: Counters::default(),
        }
    }

    fn record(&self, hit: bool) {
        let counter = if hit {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn object(&self, entity_type: &str, id: &str) -> Option<Promise<Document>> {
        let found = lock(&self.objects)
            .get(entity_type)
            .and_then(|by_id| by_id.get(id))
            .cloned();
        self.record(found.is_some());
        found
    }

    pub fn put_object(&self, entity_type: &str, id: &str, promise: Promise<Document>) {
        lock(&self.objects)
            .entry(entity_type.to_string())
            .or_default()
            .insert(id.to_string(), promise);
    }

    /// Drop one object entry. Returns whether it was present.
    pub fn evict_object(&self, entity_type: &str, id: &str) -> bool {
        lock(&self.objects)
            .get_mut(entity_type)
            .and_then(|by_id| by_id.remove(id))
            .is_some()
    }

    /// Drop an object entry only if it still holds `promise`.
    pub fn evict_object_if(&self, entity_type: &str, id: &str, promise: &Promise<Document>) {
        let mut objects = lock(&self.objects);
        if let Some(by_id) = objects.get_mut(entity_type) {
            if by_id.get(id).is_some_and(|cached| cached.same_as(promise)) {
                by_id.remove(id);
            }
        }
    }

    pub fn ids(&self, entity_type: &str, key: &str) -> Option<Arc<Vec<String>>> {
        let found = lock(&self.id_searches)
            .get(entity_type)
            .and_then(|lru| lru.get(key));
        self.record(found.is_some());
        found
    }

    pub fn put_ids(&self, entity_type: &str, key: String, ids: Vec<String>) {
        let capacity = self.capacity;
        lock(&self.id_searches)
            .entry(entity_type.to_string())
            .or_insert_with(|| lru(capacity))
            .insert(key, Arc::new(ids));
    }

    pub fn aggregate(&self, entity_type: &str, key: &str) -> Option<Arc<Vec<Value>>> {
        let found = lock(&self.aggregates)
            .get(entity_type)
            .and_then(|lru| lru.get(key));
        self.record(found.is_some());
        found
    }

    pub fn put_aggregate(&self, entity_type: &str, key: String, rows: Vec<Value>) {
        let capacity = self.capacity;
        lock(&self.aggregates)
            .entry(entity_type.to_string())
            .or_insert_with(|| lru(capacity))
            .insert(key, Arc::new(rows));
    }

    #[cfg(test)]
    fn run_pending_tasks(&self) {
        for tier in lock(&self.id_searches).values() {
            tier.run_pending_tasks();
        }
        for tier in lock(&self.aggregates).values() {
            tier.run_pending_tasks();
        }
    }

    /// Apply a dirty notification for `(entity_type, id)`.
    ///
    /// Any write can change any search or aggregate over the type, so both
    /// tiers are dropped for the whole type. Only the one object entry goes.
    pub fn invalidate(&self, entity_type: &str, id: &str) {
        let searches = lock(&self.id_searches).remove(entity_type).is_some();
        let aggregates = lock(&self.aggregates).remove(entity_type).is_some();
        let object = self.evict_object(entity_type, id);
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);

        debug!(
            entity_type,
            id,
            searches,
            aggregates,
            object,
            "cache invalidated"
        );
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ReadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadCache")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Default for ReadCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Key for a search: hash of `(type, selector, params)` in canonical form.
pub fn search_key(entity_type: &str, selector: &Value, params: &Map<String, Value>) -> String {
    hash_key(&[
        Value::String(entity_type.to_string()),
        canonical(selector),
        canonical(&Value::Object(params.clone())),
    ])
}

/// Key for an aggregation: hash of `(type, pipeline)` in canonical form.
pub fn aggregate_key(entity_type: &str, pipeline: &[Value]) -> String {
    hash_key(&[
        Value::String(entity_type.to_string()),
        Value::Array(pipeline.iter().map(canonical).collect()),
    ])
}

fn hash_key(parts: &[Value]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.to_string().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Copy of `value` with object members in sorted order at every depth.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonical(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ABC: &str = "abc123";
    const XYZ: &str = "xyz789";

    #[test]
    fn test_search_key_is_order_independent() {
        let a = search_key("Person", &json!({"a": 1, "b": {"c": 2, "d": 3}}), &Map::new());
        let b = search_key("Person", &json!({"b": {"d": 3, "c": 2}, "a": 1}), &Map::new());
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let other_type = search_key("Company", &json!({"a": 1, "b": {"c": 2, "d": 3}}), &Map::new());
        assert_ne!(a, other_type);

        let mut params = Map::new();
        params.insert("limit".into(), json!(5));
        assert_ne!(
            a,
            search_key("Person", &json!({"a": 1, "b": {"c": 2, "d": 3}}), &params)
        );
    }

    #[test]
    fn test_aggregate_key_depends_on_stage_order() {
        let first = json!({"$match": {"x": 1}});
        let second = json!({"$count": "n"});
        assert_ne!(
            aggregate_key("Person", &[first.clone(), second.clone()]),
            aggregate_key("Person", &[second, first])
        );
    }

    #[test]
    fn test_object_tier() {
        let cache = ReadCache::default();
        assert!(cache.object("Person", ABC).is_none());

        let promise = Promise::resolved(json!({"_id": ABC}));
        cache.put_object("Person", ABC, promise.clone());
        assert!(cache.object("Person", ABC).unwrap().same_as(&promise));

        // Only the matching promise is evicted.
        cache.evict_object_if("Person", ABC, &Promise::resolved(json!({})));
        assert!(cache.object("Person", ABC).is_some());
        cache.evict_object_if("Person", ABC, &promise);
        assert!(cache.object("Person", ABC).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn test_invalidate_is_coarse_for_searches_and_fine_for_objects() {
        let cache = ReadCache::default();
        cache.put_object("Person", ABC, Promise::resolved(json!({"_id": ABC})));
        cache.put_object("Person", XYZ, Promise::resolved(json!({"_id": XYZ})));
        cache.put_ids("Person", "q1".into(), vec![ABC.into()]);
        cache.put_ids("Person", "q2".into(), vec![XYZ.into()]);
        cache.put_aggregate("Person", "p1".into(), vec![json!({"n": 2})]);
        cache.put_ids("Company", "q1".into(), vec!["c".into()]);

        cache.invalidate("Person", ABC);

        assert!(cache.object("Person", ABC).is_none());
        assert!(cache.object("Person", XYZ).is_some());
        assert!(cache.ids("Person", "q1").is_none());
        assert!(cache.ids("Person", "q2").is_none());
        assert!(cache.aggregate("Person", "p1").is_none());
        assert_eq!(
            cache.ids("Company", "q1").as_deref(),
            Some(&vec!["c".to_string()])
        );
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_search_tier_evicts_least_recently_used() {
        let cache = ReadCache::new(2);
        cache.put_ids("Person", "k1".into(), vec![ABC.into()]);
        cache.put_ids("Person", "k2".into(), vec![XYZ.into()]);
        cache.run_pending_tasks();

        // k1 becomes the most recent; k2 is now the eviction candidate.
        for _ in 0..20 {
            assert!(cache.ids("Person", "k1").is_some());
        }
        assert!(cache.ids("Person", "k2").is_some());
        assert!(cache.ids("Person", "k1").is_some());
        cache.run_pending_tasks();

        cache.put_ids("Person", "k3".into(), vec![]);
        cache.run_pending_tasks();

        assert!(cache.ids("Person", "k2").is_none());
        assert!(cache.ids("Person", "k1").is_some());
        assert!(cache.ids("Person", "k3").is_some());
    }

    #[test]
    fn test_new_aggregates_replace_old_ones_when_full() {
        let cache = ReadCache::new(2);
        for i in 0..40 {
            cache.put_aggregate("Person", format!("k{i}"), vec![json!({"n": i})]);
            assert!(cache.aggregate("Person", &format!("k{i}")).is_some());
            cache.run_pending_tasks();
        }

        assert!(cache.aggregate("Person", "k0").is_none());
        assert!(cache.aggregate("Person", "k38").is_some());
        assert!(cache.aggregate("Person", "k39").is_some());
    }

    #[test]
    fn test_invalidate_unknown_type_is_noop() {
        let cache = ReadCache::default();
        cache.invalidate("Ghost", ABC);
        assert_eq!(cache.stats().invalidations, 1);
    }
}
