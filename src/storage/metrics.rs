use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for tracking engine operations and maintenance activity.
///
/// Implementations collect statistics about graph writes, cache behavior
/// and background maintenance. This information can be used for monitoring,
/// profiling and tuning memtable or cache sizes.
pub trait EngineMetrics: Send + Sync {
    /// Records the creation of a new node.
    fn node_created(&self);

    /// Records the deletion of a node.
    fn node_deleted(&self);

    /// Records an edge delta.
    ///
    /// # Parameters
    /// * `live` - `true` for an added edge, `false` for a removed one.
    fn edge_written(&self, live: bool);

    /// Records an object-cache lookup and whether it hit.
    fn cache_lookup(&self, hit: bool);

    /// Records a memtable freeze-and-swap.
    fn memtable_rotated(&self);

    /// Records a flush pass that wrote `tables` sorted tables.
    fn flush_completed(&self, tables: usize);

    /// Records a compaction pass that wrote `entries` records.
    fn compaction_completed(&self, entries: usize);
}

/// A no-op implementation of [`EngineMetrics`] that discards all recorded metrics.
#[derive(Default)]
pub struct NoopMetrics;

impl EngineMetrics for NoopMetrics {
    fn node_created(&self) {}
    fn node_deleted(&self) {}
    fn edge_written(&self, _live: bool) {}
    fn cache_lookup(&self, _hit: bool) {}
    fn memtable_rotated(&self) {}
    fn flush_completed(&self, _tables: usize) {}
    fn compaction_completed(&self, _entries: usize) {}
}

/// A thread-safe counter-based implementation of [`EngineMetrics`].
///
/// All counters are atomics and can be read from any thread while the
/// engine is running; [`CounterMetrics::snapshot`] copies them out.
#[derive(Default)]
pub struct CounterMetrics {
    /// Number of nodes created.
    pub nodes_created: AtomicU64,

    /// Number of nodes deleted.
    pub nodes_deleted: AtomicU64,

    /// Number of edges added.
    pub edges_added: AtomicU64,

    /// Number of edges removed.
    pub edges_removed: AtomicU64,

    /// Number of cache lookups served from the cache.
    pub cache_hits: AtomicU64,

    /// Number of cache lookups that required computation.
    pub cache_misses: AtomicU64,

    /// Number of memtable rotations.
    pub memtable_rotations: AtomicU64,

    /// Number of flush passes.
    pub flushes: AtomicU64,

    /// Number of sorted tables written by flushes.
    pub tables_flushed: AtomicU64,

    /// Number of compaction passes.
    pub compactions: AtomicU64,
}

/// Point-in-time copy of a [`CounterMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Number of nodes created.
    pub nodes_created: u64,
    /// Number of nodes deleted.
    pub nodes_deleted: u64,
    /// Number of edges added.
    pub edges_added: u64,
    /// Number of edges removed.
    pub edges_removed: u64,
    /// Cache hits.
    pub cache_hits: u64,
    /// Cache misses.
    pub cache_misses: u64,
    /// Memtable rotations.
    pub memtable_rotations: u64,
    /// Flush passes.
    pub flushes: u64,
    /// Sorted tables written by flushes.
    pub tables_flushed: u64,
    /// Compaction passes.
    pub compactions: u64,
}

impl CounterMetrics {
    /// Copies every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            nodes_created: self.nodes_created.load(Ordering::Relaxed),
            nodes_deleted: self.nodes_deleted.load(Ordering::Relaxed),
            edges_added: self.edges_added.load(Ordering::Relaxed),
            edges_removed: self.edges_removed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            memtable_rotations: self.memtable_rotations.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            tables_flushed: self.tables_flushed.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
        }
    }
}

impl EngineMetrics for CounterMetrics {
    fn node_created(&self) {
        self.nodes_created.fetch_add(1, Ordering::Relaxed);
    }

    fn node_deleted(&self) {
        self.nodes_deleted.fetch_add(1, Ordering::Relaxed);
    }

    fn edge_written(&self, live: bool) {
        if live {
            self.edges_added.fetch_add(1, Ordering::Relaxed);
        } else {
            self.edges_removed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn memtable_rotated(&self) {
        self.memtable_rotations.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_completed(&self, tables: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.tables_flushed
            .fetch_add(tables as u64, Ordering::Relaxed);
    }

    fn compaction_completed(&self, _entries: usize) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
///
/// The default implementation is [`NoopMetrics`], which has zero overhead
/// as it discards all recorded metrics.
pub fn default_metrics() -> Arc<dyn EngineMetrics> {
    Arc::new(NoopMetrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = CounterMetrics::default();
        metrics.node_created();
        metrics.edge_written(true);
        metrics.edge_written(false);
        metrics.cache_lookup(true);
        metrics.cache_lookup(false);
        metrics.cache_lookup(false);
        metrics.flush_completed(3);
        let snap = metrics.snapshot();
        assert_eq!(snap.nodes_created, 1);
        assert_eq!((snap.edges_added, snap.edges_removed), (1, 1));
        assert_eq!((snap.cache_hits, snap.cache_misses), (1, 2));
        assert_eq!((snap.flushes, snap.tables_flushed), (1, 3));
    }
}
