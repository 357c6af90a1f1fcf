use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::levels::LevelSet;
use crate::primitives::concurrency::LockManager;
use crate::storage::manifest::table_name;
use crate::storage::metrics::EngineMetrics;
use crate::storage::node::GraphNodeMeta;
use crate::storage::sstable::{SortedTable, TableHandle};
use crate::types::Result;

/// Result of one compaction pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactionOutcome {
    /// Sorted tables merged away.
    pub tables_merged: usize,
    /// Frozen memtables merged in.
    pub memtables_merged: usize,
    /// Records in the resulting table.
    pub entries: usize,
    /// Records dropped because their node was deleted.
    pub dropped: usize,
}

/// Merges every frozen memtable and every sorted table into one table and
/// serves on-disk reads.
pub struct CompactionManager {
    levels: Arc<LevelSet>,
    locks: Arc<LockManager>,
    metrics: Arc<dyn EngineMetrics>,
}

impl CompactionManager {
    pub(crate) fn new(
        levels: Arc<LevelSet>,
        locks: Arc<LockManager>,
        metrics: Arc<dyn EngineMetrics>,
    ) -> Self {
        Self {
            levels,
            locks,
            metrics,
        }
    }

    /// Runs a full compaction; a no-op when no memtable is frozen.
    ///
    /// Records are merged oldest to newest so the newest level decides each
    /// edge. Since nothing older than the merged set survives, deleted edges
    /// and tombstoned nodes are dropped from the output.
    pub fn run(&self) -> Result<CompactionOutcome> {
        let _maintenance = self.levels.maintenance();
        let frozen = self.levels.frozen();
        if frozen.is_empty() {
            return Ok(CompactionOutcome::default());
        }
        let tables = self.levels.tables();

        let mut keys: Vec<String> = Vec::new();
        for memtable in &frozen {
            keys.extend(memtable.table.keys());
        }
        let _guards = self.locks.acquire_many(keys.iter().map(String::as_str));

        let mut merged: BTreeMap<String, GraphNodeMeta> = BTreeMap::new();
        for table in &tables {
            let loaded = table.load()?;
            for (key, raw) in loaded.iter() {
                layer(&mut merged, key.to_owned(), GraphNodeMeta::decode(raw)?);
            }
        }
        for memtable in &frozen {
            for (key, meta) in memtable.table.entries() {
                layer(&mut merged, key, meta);
            }
        }

        let mut outcome = CompactionOutcome {
            tables_merged: tables.len(),
            memtables_merged: frozen.len(),
            ..CompactionOutcome::default()
        };
        let mut output = SortedTable::new();
        for (key, mut meta) in merged {
            if meta.is_tombstone() {
                outcome.dropped += 1;
                continue;
            }
            meta.compact();
            if meta.is_empty() {
                continue;
            }
            output.insert(key, &meta);
        }
        outcome.entries = output.len();

        let store = self.levels.store();
        let mut installed = Vec::new();
        if !output.is_empty() {
            let name = table_name(self.levels.allocate());
            output.write_to(store.as_ref(), &name)?;
            installed.push(Arc::new(TableHandle::new(
                Arc::clone(store),
                name,
                output.len(),
            )));
        }
        self.levels.install(installed, true, &frozen)?;
        self.metrics.compaction_completed(outcome.entries);
        info!(
            tables = outcome.tables_merged,
            memtables = outcome.memtables_merged,
            entries = outcome.entries,
            dropped = outcome.dropped,
            "compaction.complete"
        );
        Ok(outcome)
    }

    /// Serialized record for `node_id` from the newest sorted table holding
    /// one; `NotFound` if no table does.
    pub fn get_node_data(&self, node_id: &str) -> Result<Vec<u8>> {
        let raw = self.levels.newest_raw(node_id)?;
        debug!(node = node_id, bytes = raw.len(), "compaction.disk_read");
        Ok(raw)
    }

    /// Records for `node_id` across sorted tables, newest first, stopping
    /// at the first tombstone.
    pub fn lookup(&self, node_id: &str) -> Result<Vec<GraphNodeMeta>> {
        self.levels.table_records(node_id)
    }
}

fn layer(merged: &mut BTreeMap<String, GraphNodeMeta>, key: String, meta: GraphNodeMeta) {
    match merged.entry(key) {
        Entry::Occupied(mut slot) => slot.get_mut().absorb(&meta),
        Entry::Vacant(slot) => {
            slot.insert(meta);
        }
    }
}
