use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use super::compaction::{CompactionManager, CompactionOutcome};
use super::config::EngineConfig;
use super::flush::{FlushOutcome, FlushingManager};
use super::levels::{FrozenMemtable, LevelSet};
use super::recovery::recover;
use crate::primitives::concurrency::{LockManager, TaskScheduler};
use crate::primitives::io::{DirStore, FileStore, MemStore};
use crate::primitives::wal::{LogRecord, MergeLog, MergeLogStats};
use crate::storage::cache::{CacheKey, CacheStats, CachedValue, ObjectCache};
use crate::storage::ids::{IdentifierSource, RandomIds};
use crate::storage::indices::{NodeDataIndex, NodeIdIndex};
use crate::storage::memtable::Memtable;
use crate::storage::metrics::{default_metrics, EngineMetrics};
use crate::storage::node::{
    resolve_connections, resolve_data_pointer, EdgeFlag, GraphNodeData, GraphNodeMeta,
};
use crate::types::{GraphError, Result};

/// Longest class prefix accepted by [`sanitize_prefix`].
pub const MAX_PREFIX_LEN: usize = 20;

const MAX_WRITE_ATTEMPTS: usize = 4;
const MAX_ID_ATTEMPTS: usize = 8;

/// Validates a class prefix: at most [`MAX_PREFIX_LEN`] ASCII letters.
pub fn sanitize_prefix(prefix: &str) -> Result<()> {
    if prefix.len() > MAX_PREFIX_LEN {
        return Err(GraphError::invalid(format!(
            "prefix {prefix:?} longer than {MAX_PREFIX_LEN} characters"
        )));
    }
    if !prefix.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(GraphError::invalid(format!(
            "prefix {prefix:?} must be alphabetic"
        )));
    }
    Ok(())
}

/// Point-in-time view of engine internals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Distinct nodes written to the active memtable.
    pub active_entries: usize,
    /// Byte counter of the active memtable.
    pub active_bytes: usize,
    /// Frozen memtables waiting for a flush or compaction.
    pub frozen_memtables: usize,
    /// Live sorted tables.
    pub sorted_tables: usize,
    /// Live nodes.
    pub live_nodes: usize,
    /// Stored payloads.
    pub payloads: usize,
    /// Object-cache counters.
    pub cache: CacheStats,
    /// Merge-log counters.
    pub log: MergeLogStats,
}

/// Configures and opens a [`StorageEngine`].
pub struct EngineBuilder {
    store: Arc<dyn FileStore>,
    config: EngineConfig,
    ids: Option<Arc<dyn IdentifierSource>>,
    metrics: Option<Arc<dyn EngineMetrics>>,
}

impl EngineBuilder {
    /// Replaces the configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the identifier source (random ids by default).
    pub fn ids(mut self, ids: Arc<dyn IdentifierSource>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Installs a metrics sink.
    pub fn metrics(mut self, metrics: Arc<dyn EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Recovers state from the store and starts the engine.
    pub fn open(self) -> Result<StorageEngine> {
        let config = self.config;
        config.validate()?;
        let store = self.store;
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(RandomIds::new()) as Arc<dyn IdentifierSource>);
        let metrics = self.metrics.unwrap_or_else(default_metrics);

        let node_ids = NodeIdIndex::new();
        let node_data = Arc::new(NodeDataIndex::new());
        let recovered = recover(&store, &node_ids, &node_data)?;
        let levels = Arc::new(LevelSet::new(
            Arc::clone(&store),
            Arc::clone(&node_data),
            recovered.manifest,
            recovered.tables,
            recovered.frozen,
        ));
        let segment = levels.open_segment()?;
        let merge_log = MergeLog::open(Arc::clone(&store), segment, config.log_options());
        let locks = Arc::new(LockManager::new());
        let scheduler = TaskScheduler::new(config.worker_threads)?;
        let compaction = Arc::new(CompactionManager::new(
            Arc::clone(&levels),
            Arc::clone(&locks),
            Arc::clone(&metrics),
        ));
        let flushing = Arc::new(FlushingManager::new(
            Arc::clone(&levels),
            Arc::clone(&metrics),
        ));

        let engine = StorageEngine {
            active: RwLock::new(Arc::new(Memtable::new(config.memtable_capacity))),
            writer: Mutex::new(()),
            merge_log,
            levels,
            compaction,
            flushing,
            cache: ObjectCache::new(config.cache_capacity),
            node_ids,
            node_data,
            scheduler,
            locks,
            ids,
            metrics,
            running: AtomicBool::new(true),
            config,
        };
        info!(
            segment,
            tables = engine.levels.table_count(),
            frozen = engine.levels.frozen_count(),
            nodes = engine.node_ids.len(),
            "engine.open"
        );
        if engine.levels.frozen_count() > 0 {
            engine.schedule_maintenance();
        }
        Ok(engine)
    }
}

/// Embedded LSM storage engine for a directed property graph.
///
/// Writes layer metadata deltas into the active memtable and the merge
/// log under one writer mutex. Full memtables freeze and are swapped out,
/// then persisted by background flush or compaction jobs. Reads resolve a
/// node across the active memtable, the frozen memtables and the sorted
/// tables, newest first, and go through a shared object cache.
pub struct StorageEngine {
    config: EngineConfig,
    active: RwLock<Arc<Memtable>>,
    writer: Mutex<()>,
    merge_log: MergeLog,
    levels: Arc<LevelSet>,
    compaction: Arc<CompactionManager>,
    flushing: Arc<FlushingManager>,
    cache: ObjectCache,
    node_ids: NodeIdIndex,
    node_data: Arc<NodeDataIndex>,
    scheduler: TaskScheduler,
    locks: Arc<LockManager>,
    ids: Arc<dyn IdentifierSource>,
    metrics: Arc<dyn EngineMetrics>,
    running: AtomicBool,
}

impl StorageEngine {
    /// Starts configuring an engine persisting through `store`.
    pub fn builder(store: Arc<dyn FileStore>) -> EngineBuilder {
        EngineBuilder {
            store,
            config: EngineConfig::default(),
            ids: None,
            metrics: None,
        }
    }

    /// Opens an engine over `store` with `config`.
    pub fn open(store: Arc<dyn FileStore>, config: EngineConfig) -> Result<Self> {
        Self::builder(store).config(config).open()
    }

    /// Opens an engine persisting into the directory at `path`.
    pub fn open_dir(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        Self::open(Arc::new(DirStore::open(path)?), config)
    }

    /// Opens an engine over a fresh in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Arc::new(MemStore::new()), EngineConfig::default())
    }

    /// Stores `payload` as a new node and returns its id.
    pub fn create_node(&self, payload: impl Into<Bytes>) -> Result<String> {
        self.create_node_with_prefix("", payload.into())
    }

    /// Stores `payload` as a new node whose id starts with `class`.
    pub fn create_node_in_class(&self, class: &str, payload: impl Into<Bytes>) -> Result<String> {
        if class.is_empty() {
            return Err(GraphError::invalid("class must not be empty"));
        }
        sanitize_prefix(class)?;
        self.create_node_with_prefix(class, payload.into())
    }

    fn create_node_with_prefix(&self, class: &str, payload: Bytes) -> Result<String> {
        self.ensure_running()?;
        let data = GraphNodeData::new(self.ids.generate(), payload);
        self.node_data
            .insert(data.clone())
            .map_err(GraphError::into_engine)?;
        let written = self.fresh_node_id(class).and_then(|node_id| {
            self.apply(&node_id, GraphNodeMeta::with_data(data.id()), Some(&data))?;
            Ok(node_id)
        });
        let node_id = match written {
            Ok(node_id) => node_id,
            Err(err) => {
                self.node_data.discard(data.id());
                return Err(err);
            }
        };
        self.node_ids
            .insert(&node_id)
            .map_err(GraphError::into_engine)?;
        self.metrics.node_created();
        debug!(node = %node_id, bytes = data.payload().len(), "engine.create_node");
        Ok(node_id)
    }

    fn fresh_node_id(&self, class: &str) -> Result<String> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let node_id = format!("{class}{}", self.ids.generate());
            if !self.node_ids.exists(&node_id) {
                return Ok(node_id);
            }
        }
        Err(GraphError::invalid("identifier source keeps repeating ids"))
    }

    /// Records a live edge `from -> to`.
    pub fn add_connection(&self, from: &str, to: &str) -> Result<()> {
        self.write_edge(from, to, EdgeFlag::Live)
    }

    /// Records the removal of the edge `from -> to`.
    pub fn delete_connection(&self, from: &str, to: &str) -> Result<()> {
        self.write_edge(from, to, EdgeFlag::Deleted)
    }

    fn write_edge(&self, from: &str, to: &str, flag: EdgeFlag) -> Result<()> {
        self.ensure_running()?;
        let _guard = self.locks.acquire(from);
        self.ensure_exists(from)?;
        self.ensure_exists(to)?;
        self.apply(from, GraphNodeMeta::with_connection(to, flag), None)?;
        self.cache.invalidate_node(from);
        self.metrics.edge_written(flag.is_live());
        trace!(from, to, live = flag.is_live(), "engine.edge");
        Ok(())
    }

    /// Deletes a node: its payload, its id and every connection it owns.
    pub fn delete_node(&self, node_id: &str) -> Result<()> {
        self.ensure_running()?;
        let _guard = self.locks.acquire(node_id);
        self.ensure_exists(node_id)?;
        let pointer = self.resolved_pointer(node_id)?;
        self.apply(node_id, GraphNodeMeta::tombstone(), None)?;
        if let Some(pointer) = pointer {
            if let Err(err) = self.node_data.remove(&pointer) {
                debug!(node = node_id, error = %err, "engine.delete_node.payload_missing");
            }
        }
        self.node_ids
            .remove(node_id)
            .map_err(GraphError::into_engine)?;
        self.cache.invalidate_node(node_id);
        self.metrics.node_deleted();
        debug!(node = node_id, "engine.delete_node");
        Ok(())
    }

    /// Payload of a live node.
    pub fn get_node_data(&self, node_id: &str) -> Result<Bytes> {
        self.ensure_exists(node_id)?;
        let key = CacheKey::payload(node_id);
        if let Some(CachedValue::Payload(payload)) = self.cache.get(&key) {
            self.metrics.cache_lookup(true);
            return Ok(payload);
        }
        self.metrics.cache_lookup(false);
        let epoch = self.cache.epoch();
        let pointer = self
            .resolved_pointer(node_id)?
            .ok_or_else(|| GraphError::invalid(format!("node {node_id} has no data")))?;
        let payload = self
            .node_data
            .get(&pointer)
            .map_err(GraphError::into_engine)?
            .into_payload();
        self.cache
            .put_if_fresh(&key, CachedValue::Payload(payload.clone()), epoch);
        Ok(payload)
    }

    /// Sorted live targets of `node_id` whose ids start with `prefix`; an
    /// empty prefix returns every live target.
    pub fn match_connections(&self, node_id: &str, prefix: &str) -> Result<Vec<String>> {
        self.ensure_exists(node_id)?;
        if !prefix.is_empty() {
            sanitize_prefix(prefix)?;
        }
        let key = CacheKey::connections(node_id, prefix);
        if let Some(CachedValue::Connections(targets)) = self.cache.get(&key) {
            self.metrics.cache_lookup(true);
            return Ok(targets.as_ref().clone());
        }
        self.metrics.cache_lookup(false);
        let epoch = self.cache.epoch();
        let mut targets = self.resolved_connections(node_id)?;
        if !prefix.is_empty() {
            targets.retain(|target| target.starts_with(prefix));
        }
        self.cache.put_if_fresh(
            &key,
            CachedValue::Connections(Arc::new(targets.clone())),
            epoch,
        );
        Ok(targets)
    }

    /// True if `node_id` names a live node.
    pub fn node_exists(&self, node_id: &str) -> bool {
        self.node_ids.exists(node_id)
    }

    /// False once [`StorageEngine::shutdown`] ran.
    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Byte counter of the active memtable.
    pub fn active_memtable_size(&self) -> usize {
        self.active.read().size()
    }

    /// Runs a full compaction on the calling thread.
    pub fn trigger_compaction(&self) -> Result<CompactionOutcome> {
        self.ensure_running()?;
        self.compaction.run()
    }

    /// Persists every frozen memtable on the calling thread.
    pub fn trigger_flush(&self) -> Result<FlushOutcome> {
        self.ensure_running()?;
        self.flushing.run()
    }

    /// Freezes the active memtable and moves writes to a fresh one, even if
    /// it is not full.
    pub fn rotate_memtable(&self) -> Result<()> {
        let _writer = self.writer.lock();
        self.ensure_running()?;
        let current = Arc::clone(&*self.active.read());
        if current.is_empty() {
            return Ok(());
        }
        self.rotate_locked(&current)
    }

    /// Writes and syncs buffered merge-log records.
    pub fn flush_log(&self) -> Result<()> {
        self.merge_log.flush_to_disk()
    }

    /// On-disk reader used for the sorted-table level.
    pub fn compaction(&self) -> &CompactionManager {
        &self.compaction
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Snapshot of engine internals.
    pub fn stats(&self) -> EngineStats {
        let active = Arc::clone(&*self.active.read());
        EngineStats {
            active_entries: active.count(),
            active_bytes: active.size(),
            frozen_memtables: self.levels.frozen_count(),
            sorted_tables: self.levels.table_count(),
            live_nodes: self.node_ids.len(),
            payloads: self.node_data.len(),
            cache: self.cache.stats(),
            log: self.merge_log.stats(),
        }
    }

    /// Stops the engine: rejects further writes, freezes the active
    /// memtable, cancels queued background work, persists every frozen
    /// memtable, flushes the merge log and releases all node locks.
    /// Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        info!("engine.shutdown");
        let dumped = self.force_dump();
        let cancelled = self.scheduler.cancel_all_tasks();
        let flushed = dumped.and_then(|()| self.flushing.run());
        self.flushing.shutdown();
        let synced = self.merge_log.flush_to_disk();
        self.locks.release_all();
        self.scheduler.shutdown();
        let outcome = flushed?;
        synced?;
        info!(
            cancelled,
            tables = outcome.tables,
            entries = outcome.entries,
            "engine.shutdown.complete"
        );
        Ok(())
    }

    fn force_dump(&self) -> Result<()> {
        let _writer = self.writer.lock();
        self.merge_log.flush_to_disk()?;
        let current = Arc::clone(&*self.active.read());
        current.freeze();
        self.levels.push_frozen(FrozenMemtable {
            table: current,
            segment: self.merge_log.segment(),
        });
        *self.active.write() = Arc::new(Memtable::new(self.config.memtable_capacity));
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(GraphError::Shutdown("storage engine is shut down"))
        }
    }

    fn ensure_exists(&self, node_id: &str) -> Result<()> {
        if self.node_ids.exists(node_id) {
            Ok(())
        } else {
            Err(GraphError::invalid(format!("node {node_id} does not exist")))
        }
    }

    /// Appends `meta` to the merge log and layers it into the active
    /// memtable, rotating the memtable when it fills up.
    ///
    /// The log append is the commit point: room is reserved first, and a
    /// failed append leaves the memtable untouched.
    fn apply(
        &self,
        node_id: &str,
        meta: GraphNodeMeta,
        data: Option<&GraphNodeData>,
    ) -> Result<()> {
        let _writer = self.writer.lock();
        // Shutdown dumps the active memtable under this lock.
        self.ensure_running()?;
        let mut last_err = GraphError::MemtableFrozen;
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let active = Arc::clone(&*self.active.read());
            match active.reserve(node_id, &meta) {
                Ok(()) => {
                    match data {
                        // Payload first, so replay never sees a pointer without data.
                        Some(data) => self.merge_log.append_all(&[
                            LogRecord::Data(data.clone()),
                            LogRecord::Meta {
                                node_id: node_id.to_owned(),
                                meta: meta.clone(),
                            },
                        ])?,
                        None => self.merge_log.append(node_id, &meta)?,
                    }
                    return active.insert(node_id, meta);
                }
                Err(err) if err.is_retryable() && active.is_frozen() => {
                    self.rotate_locked(&active)?;
                    last_err = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    /// Caller holds the writer mutex.
    fn rotate_locked(&self, current: &Arc<Memtable>) -> Result<()> {
        current.freeze();
        let next = self.levels.open_segment()?;
        let previous = self.merge_log.rotate(next)?;
        // Visible as frozen before it stops being active.
        self.levels.push_frozen(FrozenMemtable {
            table: Arc::clone(current),
            segment: previous,
        });
        *self.active.write() = Arc::new(Memtable::new(self.config.memtable_capacity));
        self.metrics.memtable_rotated();
        debug!(
            segment = next,
            frozen = self.levels.frozen_count(),
            entries = current.count(),
            "engine.memtable.rotate"
        );
        self.schedule_maintenance();
        Ok(())
    }

    fn schedule_maintenance(&self) {
        if !self.config.background_maintenance || !self.is_active() {
            return;
        }
        let compact = self.levels.table_count() + 1 >= self.config.compaction_trigger_tables;
        let submitted = if compact {
            let compaction = Arc::clone(&self.compaction);
            self.scheduler.submit("compaction", move || {
                if let Err(err) = compaction.run() {
                    warn!(error = %err, "compaction.failed");
                }
            })
        } else {
            let flushing = Arc::clone(&self.flushing);
            self.scheduler.submit("flush", move || {
                if let Err(err) = flushing.run() {
                    warn!(error = %err, "flush.failed");
                }
            })
        };
        if let Err(err) = submitted {
            debug!(error = %err, "engine.maintenance_skipped");
        }
    }

    /// Records for `node_id` in the active and frozen memtables, newest first.
    fn memory_levels(&self, node_id: &str) -> Vec<GraphNodeMeta> {
        let active = Arc::clone(&*self.active.read());
        let mut levels = Vec::new();
        levels.extend(active.get(node_id));
        for frozen in self.levels.frozen().iter().rev() {
            levels.extend(frozen.table.get(node_id));
        }
        levels
    }

    fn resolved_pointer(&self, node_id: &str) -> Result<Option<String>> {
        let mut levels = self.memory_levels(node_id);
        let decided = levels
            .iter()
            .any(|meta| meta.is_tombstone() || !meta.data_id().is_empty());
        if !decided {
            levels.extend(self.compaction.lookup(node_id)?);
        }
        Ok(resolve_data_pointer(&levels).map(str::to_owned))
    }

    fn resolved_connections(&self, node_id: &str) -> Result<Vec<String>> {
        let mut levels = self.memory_levels(node_id);
        if !levels.iter().any(GraphNodeMeta::is_tombstone) {
            levels.extend(self.compaction.lookup(node_id)?);
        }
        Ok(resolve_connections(&levels))
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "engine.shutdown_failed");
        }
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("active", &self.is_active())
            .field("stats", &self.stats())
            .finish()
    }
}
