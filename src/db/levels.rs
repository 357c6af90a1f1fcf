use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

use crate::primitives::io::FileStore;
use crate::primitives::wal::MergeLog;
use crate::storage::indices::NodeDataIndex;
use crate::storage::manifest::{snapshot_name, Manifest};
use crate::storage::memtable::Memtable;
use crate::storage::node::GraphNodeMeta;
use crate::storage::sstable::TableHandle;
use crate::types::{GraphError, Result};

/// A memtable that stopped accepting writes, paired with the merge-log
/// segment holding its records.
#[derive(Clone, Debug)]
pub struct FrozenMemtable {
    /// The frozen table.
    pub table: Arc<Memtable>,
    /// Segment sequence number owned by the table.
    pub segment: u64,
}

/// Everything below the active memtable: frozen memtables awaiting
/// persistence, live sorted tables and the manifest describing them.
///
/// Flush and compaction take [`LevelSet::maintenance`] so that only one of
/// them rewrites the level structure at a time.
pub(crate) struct LevelSet {
    store: Arc<dyn FileStore>,
    node_data: Arc<NodeDataIndex>,
    frozen: RwLock<Vec<FrozenMemtable>>,
    tables: RwLock<Vec<Arc<TableHandle>>>,
    manifest: Mutex<Manifest>,
    maintenance: Mutex<()>,
}

impl LevelSet {
    pub(crate) fn new(
        store: Arc<dyn FileStore>,
        node_data: Arc<NodeDataIndex>,
        manifest: Manifest,
        tables: Vec<Arc<TableHandle>>,
        frozen: Vec<FrozenMemtable>,
    ) -> Self {
        Self {
            store,
            node_data,
            frozen: RwLock::new(frozen),
            tables: RwLock::new(tables),
            manifest: Mutex::new(manifest),
            maintenance: Mutex::new(()),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    pub(crate) fn maintenance(&self) -> MutexGuard<'_, ()> {
        self.maintenance.lock()
    }

    /// Frozen memtables, oldest first.
    pub(crate) fn frozen(&self) -> Vec<FrozenMemtable> {
        self.frozen.read().clone()
    }

    pub(crate) fn frozen_count(&self) -> usize {
        self.frozen.read().len()
    }

    pub(crate) fn push_frozen(&self, frozen: FrozenMemtable) {
        self.frozen.write().push(frozen);
    }

    /// Live sorted tables, oldest first.
    pub(crate) fn tables(&self) -> Vec<Arc<TableHandle>> {
        self.tables.read().clone()
    }

    pub(crate) fn table_count(&self) -> usize {
        self.tables.read().len()
    }

    /// Reserves a file sequence number without persisting the manifest.
    pub(crate) fn allocate(&self) -> u64 {
        self.manifest.lock().allocate()
    }

    /// Reserves a new merge-log segment and records it in the manifest.
    pub(crate) fn open_segment(&self) -> Result<u64> {
        let mut manifest = self.manifest.lock();
        let seq = manifest.allocate();
        manifest.log_segments.push(seq);
        manifest.persist(self.store.as_ref())?;
        Ok(seq)
    }

    /// Records stored for `node_id` in every sorted table, newest first.
    /// Corrupt tables are skipped.
    pub(crate) fn table_records(&self, node_id: &str) -> Result<Vec<GraphNodeMeta>> {
        let tables = self.tables();
        let mut found = Vec::new();
        for table in tables.iter().rev() {
            let meta = match table.lookup(node_id) {
                Ok(Some(meta)) => meta,
                Ok(None) => continue,
                Err(GraphError::CorruptTable(reason)) => {
                    warn!(file = table.name(), %reason, "levels.corrupt_table");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let stop = meta.is_tombstone();
            found.push(meta);
            if stop {
                break;
            }
        }
        Ok(found)
    }

    /// Serialized record for `node_id` from the newest readable table
    /// holding one.
    pub(crate) fn newest_raw(&self, node_id: &str) -> Result<Vec<u8>> {
        let tables = self.tables();
        for table in tables.iter().rev() {
            match table.get_raw(node_id) {
                Ok(bytes) => return Ok(bytes),
                Err(GraphError::NotFound(_)) => continue,
                Err(GraphError::CorruptTable(reason)) => {
                    warn!(file = table.name(), %reason, "levels.corrupt_table");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(GraphError::NotFound(format!("node {node_id} on disk")))
    }

    /// Persists a new level structure and swaps it in.
    ///
    /// `tables` is the complete new table list when `replace` is set and is
    /// appended to the current list otherwise. The consumed frozen memtables
    /// leave the frozen list only after the new tables are visible, and
    /// their segments are deleted once the manifest no longer lists them.
    ///
    /// A replacing install writes a full payload snapshot and retires every
    /// older payload file. An appending install only writes the payloads
    /// the consumed memtables point at, as a delta.
    pub(crate) fn install(
        &self,
        new_tables: Vec<Arc<TableHandle>>,
        replace: bool,
        consumed: &[FrozenMemtable],
    ) -> Result<()> {
        let payloads = if replace {
            self.node_data.snapshot()
        } else {
            let data_ids: Vec<String> = consumed
                .iter()
                .flat_map(|frozen| frozen.table.entries())
                .filter(|(_, meta)| !meta.is_tombstone() && !meta.data_id().is_empty())
                .map(|(_, meta)| meta.data_id().to_owned())
                .collect();
            self.node_data.snapshot_of(data_ids.iter().map(String::as_str))
        };
        let mut retired = Vec::new();
        {
            let mut manifest = self.manifest.lock();
            let payload_file = if replace || !payloads.is_empty() {
                let name = snapshot_name(manifest.allocate());
                payloads.write_to(self.store.as_ref(), &name)?;
                Some(name)
            } else {
                None
            };
            let names: Vec<String> = new_tables.iter().map(|t| t.name().to_owned()).collect();
            let mut next = manifest.clone();
            if replace {
                next.tables = names;
                retired.extend(next.data_snapshot.take());
                retired.append(&mut next.data_deltas);
                next.data_snapshot = payload_file;
            } else {
                next.tables.extend(names);
                next.data_deltas.extend(payload_file);
            }
            next.log_segments
                .retain(|seq| !consumed.iter().any(|f| f.segment == *seq));
            next.persist(self.store.as_ref())?;
            *manifest = next;
        }

        let replaced = {
            let mut tables = self.tables.write();
            if replace {
                std::mem::replace(&mut *tables, new_tables)
            } else {
                tables.extend(new_tables);
                Vec::new()
            }
        };
        for table in &replaced {
            table.mark_obsolete();
        }
        self.frozen
            .write()
            .retain(|f| !consumed.iter().any(|c| Arc::ptr_eq(&c.table, &f.table)));

        for frozen in consumed {
            if let Err(err) = MergeLog::remove_segment(self.store.as_ref(), frozen.segment) {
                warn!(segment = frozen.segment, error = %err, "levels.remove_segment_failed");
            }
        }
        for old in &retired {
            if let Err(err) = self.store.remove(old) {
                warn!(file = %old, error = %err, "levels.remove_snapshot_failed");
            }
        }
        debug!(
            consumed = consumed.len(),
            replaced = replaced.len(),
            payloads = payloads.len(),
            "levels.install"
        );
        Ok(())
    }
}
