use std::num::NonZeroUsize;
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

/// Default number of cached objects.
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

const CONNECTIONS_SUFFIX: &str = "_connections";

/// Identifies one cached object derived from a node.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum CacheKey {
    /// The node's payload.
    Payload(String),
    /// The node's live connections, optionally filtered by a class prefix.
    Connections {
        /// Source node.
        node: String,
        /// Class prefix; empty for the unfiltered list.
        prefix: String,
    },
}

impl CacheKey {
    /// Key for `node`'s payload.
    pub fn payload(node: impl Into<String>) -> Self {
        CacheKey::Payload(node.into())
    }

    /// Key for `node`'s connection list filtered by `prefix`.
    pub fn connections(node: impl Into<String>, prefix: impl Into<String>) -> Self {
        CacheKey::Connections {
            node: node.into(),
            prefix: prefix.into(),
        }
    }

    /// Node the cached object was derived from.
    pub fn node(&self) -> &str {
        match self {
            CacheKey::Payload(node) | CacheKey::Connections { node, .. } => node,
        }
    }

    /// Flat string form: `id`, `id_connections` or `id_connections_prefix`.
    pub fn render(&self) -> String {
        match self {
            CacheKey::Payload(node) => node.clone(),
            CacheKey::Connections { node, prefix } if prefix.is_empty() => {
                format!("{node}{CONNECTIONS_SUFFIX}")
            }
            CacheKey::Connections { node, prefix } => {
                format!("{node}{CONNECTIONS_SUFFIX}_{prefix}")
            }
        }
    }
}

/// Value held by the [`ObjectCache`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CachedValue {
    /// A node payload.
    Payload(Bytes),
    /// A resolved, sorted connection list.
    Connections(Arc<Vec<String>>),
}

/// Hit/miss counters of the object cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that missed.
    pub misses: u64,
    /// Entries currently cached.
    pub entries: usize,
}

/// Invalidation generation observed by a reader before it computed a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheEpoch(u64);

struct CacheInner {
    entries: LruCache<String, (String, CachedValue)>,
    related: FxHashMap<String, FxHashSet<String>>,
    epoch: u64,
    hits: u64,
    misses: u64,
}

impl CacheInner {
    fn forget_related(&mut self, node: &str, rendered: &str) {
        if let Some(keys) = self.related.get_mut(node) {
            keys.remove(rendered);
            if keys.is_empty() {
                self.related.remove(node);
            }
        }
    }
}

/// Bounded LRU cache of payloads and connection lists.
///
/// Every cached object is registered under the node it was derived from so
/// that [`ObjectCache::invalidate_node`] drops all of them at once. Each
/// invalidation bumps an epoch; readers fill the cache through
/// [`ObjectCache::put_if_fresh`] so that a value computed before a
/// concurrent write is discarded instead of cached.
pub struct ObjectCache {
    inner: Mutex<CacheInner>,
}

impl ObjectCache {
    /// Cache holding at most `capacity` objects.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                related: FxHashMap::default(),
                epoch: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Looks `key` up, promoting it on a hit.
    pub fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        let mut inner = self.inner.lock();
        let found = inner
            .entries
            .get(&key.render())
            .map(|(_, value)| value.clone());
        if found.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        found
    }

    /// Inserts `value` unconditionally, evicting the least recently used
    /// entry when full.
    pub fn put(&self, key: &CacheKey, value: CachedValue) {
        let mut inner = self.inner.lock();
        Self::insert(&mut inner, key, value);
    }

    /// Current invalidation epoch.
    pub fn epoch(&self) -> CacheEpoch {
        CacheEpoch(self.inner.lock().epoch)
    }

    /// Inserts `value` only if nothing was invalidated since `epoch`.
    pub fn put_if_fresh(&self, key: &CacheKey, value: CachedValue, epoch: CacheEpoch) -> bool {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch.0 {
            return false;
        }
        Self::insert(&mut inner, key, value);
        true
    }

    fn insert(inner: &mut CacheInner, key: &CacheKey, value: CachedValue) {
        let rendered = key.render();
        let node = key.node().to_owned();
        inner
            .related
            .entry(node.clone())
            .or_default()
            .insert(rendered.clone());
        if let Some((evicted, (owner, _))) = inner.entries.push(rendered.clone(), (node, value)) {
            if evicted != rendered {
                inner.forget_related(&owner, &evicted);
            }
        }
    }

    /// Removes a single cached object.
    pub fn invalidate(&self, key: &CacheKey) {
        let mut inner = self.inner.lock();
        let rendered = key.render();
        inner.entries.pop(&rendered);
        inner.forget_related(key.node(), &rendered);
        inner.epoch += 1;
    }

    /// Removes every cached object derived from `node`.
    pub fn invalidate_node(&self, node: &str) {
        let mut inner = self.inner.lock();
        if let Some(keys) = inner.related.remove(node) {
            for key in keys {
                inner.entries.pop(&key);
            }
        }
        inner.epoch += 1;
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hit/miss counters and current size.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            entries: inner.entries.len(),
        }
    }
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conns(items: &[&str]) -> CachedValue {
        CachedValue::Connections(Arc::new(items.iter().map(|s| s.to_string()).collect()))
    }

    #[test]
    fn keys_render_like_flat_strings() {
        assert_eq!(CacheKey::payload("n1").render(), "n1");
        assert_eq!(CacheKey::connections("n1", "").render(), "n1_connections");
        assert_eq!(
            CacheKey::connections("n1", "user").render(),
            "n1_connections_user"
        );
    }

    #[test]
    fn invalidate_node_drops_derived_entries() {
        let cache = ObjectCache::new(16);
        cache.put(
            &CacheKey::payload("n1"),
            CachedValue::Payload(Bytes::from_static(b"x")),
        );
        cache.put(&CacheKey::connections("n1", ""), conns(&["n2"]));
        cache.put(&CacheKey::connections("n1", "user"), conns(&[]));
        cache.put(&CacheKey::connections("n2", ""), conns(&["n1"]));
        cache.invalidate_node("n1");
        assert!(cache.get(&CacheKey::payload("n1")).is_none());
        assert!(cache.get(&CacheKey::connections("n1", "user")).is_none());
        assert_eq!(
            cache.get(&CacheKey::connections("n2", "")),
            Some(conns(&["n1"]))
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn invalidate_drops_only_the_given_key() {
        let cache = ObjectCache::new(16);
        let payload = CacheKey::payload("n1");
        let listing = CacheKey::connections("n1", "");
        cache.put(&payload, CachedValue::Payload(Bytes::from_static(b"x")));
        cache.put(&listing, conns(&["n2"]));
        let epoch = cache.epoch();

        cache.invalidate(&listing);
        assert!(cache.get(&listing).is_none());
        assert_eq!(
            cache.get(&payload),
            Some(CachedValue::Payload(Bytes::from_static(b"x")))
        );
        assert!(cache.epoch() > epoch);

        // The node's remaining entries are still tracked for node-wide drops.
        cache.invalidate_node("n1");
        assert!(cache.get(&payload).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn lru_eviction_respects_capacity() {
        let cache = ObjectCache::new(2);
        cache.put(&CacheKey::connections("a", ""), conns(&[]));
        cache.put(&CacheKey::connections("b", ""), conns(&[]));
        assert!(cache.get(&CacheKey::connections("a", "")).is_some());
        cache.put(&CacheKey::connections("c", ""), conns(&[]));
        assert!(cache.get(&CacheKey::connections("b", "")).is_none());
        assert!(cache.get(&CacheKey::connections("a", "")).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn stale_fill_is_discarded() {
        let cache = ObjectCache::new(8);
        let key = CacheKey::connections("a", "");
        let epoch = cache.epoch();
        cache.invalidate_node("a");
        assert!(!cache.put_if_fresh(&key, conns(&["old"]), epoch));
        assert!(cache.get(&key).is_none());
        assert!(cache.put_if_fresh(&key, conns(&["new"]), cache.epoch()));
        assert_eq!(cache.get(&key), Some(conns(&["new"])));
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let cache = ObjectCache::new(8);
        let key = CacheKey::payload("a");
        assert!(cache.get(&key).is_none());
        cache.put(&key, CachedValue::Payload(Bytes::new()));
        assert!(cache.get(&key).is_some());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }
}
