use serde::Deserialize;

use crate::primitives::concurrency::default_parallelism;
use crate::primitives::wal::{MergeLogOptions, SyncMode};
use crate::storage::cache::DEFAULT_CACHE_CAPACITY;
use crate::storage::memtable::DEFAULT_MEMTABLE_CAPACITY;
use crate::types::{GraphError, Result};

/// Tunables for a [`StorageEngine`](crate::db::StorageEngine).
///
/// Every field has a default, so a TOML document only needs the keys it
/// overrides.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Bytes an active memtable may hold before it freezes.
    pub memtable_capacity: usize,
    /// Objects held by the payload/connection cache.
    pub cache_capacity: usize,
    /// Background worker threads.
    pub worker_threads: usize,
    /// Merge-log sync policy.
    pub sync_mode: SyncMode,
    /// Records buffered before a batched merge-log flush.
    pub log_batch_entries: usize,
    /// Rotations that would leave at least this many sorted tables
    /// schedule a compaction instead of a flush.
    pub compaction_trigger_tables: usize,
    /// Submit flush or compaction jobs when a memtable rotates.
    pub background_maintenance: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memtable_capacity: DEFAULT_MEMTABLE_CAPACITY,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            worker_threads: default_parallelism(),
            sync_mode: SyncMode::Immediate,
            log_batch_entries: 64,
            compaction_trigger_tables: 4,
            background_maintenance: true,
        }
    }
}

impl EngineConfig {
    /// Syncs every merge-log record before the write returns.
    pub fn durable() -> Self {
        Self {
            sync_mode: SyncMode::Immediate,
            log_batch_entries: 1,
            ..Self::default()
        }
    }

    /// Batches merge-log syncs and uses larger memtables and caches.
    pub fn throughput() -> Self {
        Self {
            memtable_capacity: 8 * DEFAULT_MEMTABLE_CAPACITY,
            cache_capacity: 4 * DEFAULT_CACHE_CAPACITY,
            sync_mode: SyncMode::Batched,
            log_batch_entries: 256,
            compaction_trigger_tables: 8,
            ..Self::default()
        }
    }

    /// Parses a TOML document, filling unspecified keys with defaults.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let config: Self = toml::from_str(src)
            .map_err(|err| GraphError::invalid(format!("engine config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.memtable_capacity == 0 {
            return Err(GraphError::invalid("memtable_capacity must be non-zero"));
        }
        if self.cache_capacity == 0 {
            return Err(GraphError::invalid("cache_capacity must be non-zero"));
        }
        if self.worker_threads == 0 {
            return Err(GraphError::invalid("worker_threads must be non-zero"));
        }
        if self.compaction_trigger_tables == 0 {
            return Err(GraphError::invalid(
                "compaction_trigger_tables must be non-zero",
            ));
        }
        Ok(())
    }

    /// Sets [`EngineConfig::memtable_capacity`].
    pub fn memtable_capacity(mut self, bytes: usize) -> Self {
        self.memtable_capacity = bytes;
        self
    }

    /// Sets [`EngineConfig::cache_capacity`].
    pub fn cache_capacity(mut self, entries: usize) -> Self {
        self.cache_capacity = entries;
        self
    }

    /// Sets [`EngineConfig::worker_threads`].
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Sets [`EngineConfig::sync_mode`].
    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Sets [`EngineConfig::log_batch_entries`].
    pub fn log_batch_entries(mut self, entries: usize) -> Self {
        self.log_batch_entries = entries;
        self
    }

    /// Sets [`EngineConfig::compaction_trigger_tables`].
    pub fn compaction_trigger_tables(mut self, tables: usize) -> Self {
        self.compaction_trigger_tables = tables;
        self
    }

    /// Sets [`EngineConfig::background_maintenance`].
    pub fn background_maintenance(mut self, enabled: bool) -> Self {
        self.background_maintenance = enabled;
        self
    }

    pub(crate) fn log_options(&self) -> MergeLogOptions {
        MergeLogOptions {
            sync_mode: self.sync_mode,
            batch_entries: self.log_batch_entries,
        }
    }
}
