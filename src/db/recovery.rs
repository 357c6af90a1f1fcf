use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashSet;
use tracing::{debug, info};

use super::levels::FrozenMemtable;
use crate::primitives::io::FileStore;
use crate::primitives::wal::{LogRecord, MergeLog};
use crate::storage::indices::{NodeDataIndex, NodeIdIndex};
use crate::storage::manifest::Manifest;
use crate::storage::memtable::Memtable;
use crate::storage::node::{resolve_data_pointer, GraphNodeMeta};
use crate::storage::sstable::{SortedTable, TableHandle};
use crate::types::Result;

/// State rebuilt from a store before the engine starts accepting writes.
pub(crate) struct Recovered {
    pub(crate) manifest: Manifest,
    pub(crate) tables: Vec<Arc<TableHandle>>,
    pub(crate) frozen: Vec<FrozenMemtable>,
}

/// Loads the manifest, payload snapshot and sorted tables, then replays
/// every live merge-log segment into its own frozen memtable.
pub(crate) fn recover(
    store: &Arc<dyn FileStore>,
    node_ids: &NodeIdIndex,
    node_data: &NodeDataIndex,
) -> Result<Recovered> {
    let manifest = Manifest::load(store.as_ref())?.unwrap_or_default();
    for snapshot in manifest.data_snapshot.iter().chain(&manifest.data_deltas) {
        let table = SortedTable::read_from(store.as_ref(), snapshot)?;
        node_data.load_snapshot(&table);
        debug!(file = %snapshot, payloads = table.len(), "recovery.snapshot");
    }

    let mut merged: BTreeMap<String, GraphNodeMeta> = BTreeMap::new();
    let mut tables = Vec::with_capacity(manifest.tables.len());
    for name in &manifest.tables {
        let table = SortedTable::read_from(store.as_ref(), name)?;
        for (key, raw) in table.iter() {
            let meta = GraphNodeMeta::decode(raw)?;
            match merged.entry(key.to_owned()) {
                Entry::Occupied(mut slot) => slot.get_mut().absorb(&meta),
                Entry::Vacant(slot) => {
                    slot.insert(meta);
                }
            }
        }
        tables.push(Arc::new(TableHandle::new(
            Arc::clone(store),
            name.clone(),
            table.len(),
        )));
    }
    let mut referenced: FxHashSet<&str> = FxHashSet::default();
    for (node_id, meta) in &merged {
        if !meta.is_tombstone() && !meta.data_id().is_empty() {
            node_ids.restore(node_id);
            referenced.insert(meta.data_id());
        }
    }
    // Payloads of nodes deleted after their delta was written. Payloads
    // still owned by a live segment come back with its replay.
    let pruned = node_data.retain(|id| referenced.contains(id));
    if pruned > 0 {
        debug!(pruned, "recovery.prune_payloads");
    }

    let mut frozen: Vec<FrozenMemtable> = Vec::with_capacity(manifest.log_segments.len());
    let mut replayed = 0usize;
    for &segment in &manifest.log_segments {
        let memtable = Memtable::new(usize::MAX);
        for record in MergeLog::replay_segment(store.as_ref(), segment)? {
            replayed += 1;
            match record {
                LogRecord::Data(data) => node_data.restore(data),
                LogRecord::Meta { node_id, meta } => {
                    if meta.is_tombstone() {
                        if let Some(pointer) =
                            current_pointer(&node_id, &memtable, &frozen, &merged)
                        {
                            node_data.discard(&pointer);
                        }
                        node_ids.discard(&node_id);
                    } else if !meta.data_id().is_empty() {
                        node_ids.restore(&node_id);
                    }
                    memtable.insert(node_id, meta)?;
                }
            }
        }
        memtable.freeze();
        frozen.push(FrozenMemtable {
            table: Arc::new(memtable),
            segment,
        });
    }

    info!(
        tables = tables.len(),
        segments = frozen.len(),
        records = replayed,
        nodes = node_ids.len(),
        "recovery.complete"
    );
    Ok(Recovered {
        manifest,
        tables,
        frozen,
    })
}

fn current_pointer(
    node_id: &str,
    current: &Memtable,
    frozen: &[FrozenMemtable],
    merged: &BTreeMap<String, GraphNodeMeta>,
) -> Option<String> {
    let mut levels: Vec<GraphNodeMeta> = Vec::new();
    levels.extend(current.get(node_id));
    for older in frozen.iter().rev() {
        levels.extend(older.table.get(node_id));
    }
    levels.extend(merged.get(node_id).cloned());
    resolve_data_pointer(&levels).map(str::to_owned)
}
