use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

use super::node::GraphNodeData;
use super::sstable::SortedTable;
use crate::types::{GraphError, Result};

/// Set of live node ids.
#[derive(Default)]
pub struct NodeIdIndex {
    ids: RwLock<FxHashSet<String>>,
}

impl NodeIdIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id`; fails with `AlreadyExists` if it is present.
    pub fn insert(&self, id: &str) -> Result<()> {
        if self.ids.write().insert(id.to_owned()) {
            Ok(())
        } else {
            Err(GraphError::AlreadyExists(format!("node {id}")))
        }
    }

    /// Unregisters `id`; fails with `NotFound` if it is absent.
    pub fn remove(&self, id: &str) -> Result<()> {
        if self.ids.write().remove(id) {
            Ok(())
        } else {
            Err(GraphError::NotFound(format!("node {id}")))
        }
    }

    /// True if `id` names a live node.
    pub fn exists(&self, id: &str) -> bool {
        self.ids.read().contains(id)
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    /// True when no node is live.
    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }

    /// Live ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ids.read().iter().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn restore(&self, id: &str) {
        self.ids.write().insert(id.to_owned());
    }

    pub(crate) fn discard(&self, id: &str) {
        self.ids.write().remove(id);
    }
}

/// Map from data id to payload.
#[derive(Default)]
pub struct NodeDataIndex {
    data: RwLock<FxHashMap<String, GraphNodeData>>,
}

impl NodeDataIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` under its id.
    ///
    /// Fails with `InvalidArgument` for an empty id and with
    /// `AlreadyExists` when the id is taken.
    pub fn insert(&self, data: GraphNodeData) -> Result<()> {
        if data.id().is_empty() {
            return Err(GraphError::invalid("data id must not be empty"));
        }
        let mut map = self.data.write();
        if map.contains_key(data.id()) {
            return Err(GraphError::AlreadyExists(format!("data {}", data.id())));
        }
        map.insert(data.id().to_owned(), data);
        Ok(())
    }

    /// Payload stored under `id`.
    pub fn get(&self, id: &str) -> Result<GraphNodeData> {
        self.data
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| GraphError::NotFound(format!("data {id}")))
    }

    /// Removes and returns the payload stored under `id`.
    pub fn remove(&self, id: &str) -> Result<GraphNodeData> {
        self.data
            .write()
            .remove(id)
            .ok_or_else(|| GraphError::NotFound(format!("data {id}")))
    }

    /// Number of stored payloads.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// True when no payload is stored.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Snapshot of every payload as a sorted table keyed by data id.
    pub fn snapshot(&self) -> SortedTable {
        let map = self.data.read();
        let mut table = SortedTable::new();
        for (id, data) in map.iter() {
            table.insert_raw(id.clone(), data.payload().to_vec());
        }
        table
    }

    /// Snapshot of the payloads stored under `ids`. Ids without a payload
    /// are skipped.
    pub fn snapshot_of<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> SortedTable {
        let map = self.data.read();
        let mut table = SortedTable::new();
        for id in ids {
            if let Some(data) = map.get(id) {
                table.insert_raw(id, data.payload().to_vec());
            }
        }
        table
    }

    /// Loads every entry of a snapshot produced by [`NodeDataIndex::snapshot`].
    pub fn load_snapshot(&self, table: &SortedTable) {
        let mut map = self.data.write();
        for (id, payload) in table.iter() {
            map.insert(id.to_owned(), GraphNodeData::new(id, payload.to_vec()));
        }
    }

    pub(crate) fn restore(&self, data: GraphNodeData) {
        self.data.write().insert(data.id().to_owned(), data);
    }

    pub(crate) fn discard(&self, id: &str) {
        self.data.write().remove(id);
    }

    /// Drops every payload whose id fails `keep`; returns how many went.
    pub(crate) fn retain(&self, mut keep: impl FnMut(&str) -> bool) -> usize {
        let mut map = self.data.write();
        let before = map.len();
        map.retain(|id, _| keep(id));
        before - map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_reject_duplicates_and_missing() {
        let index = NodeIdIndex::new();
        index.insert("a").unwrap();
        assert!(matches!(index.insert("a"), Err(GraphError::AlreadyExists(_))));
        assert!(index.exists("a"));
        index.remove("a").unwrap();
        assert!(matches!(index.remove("a"), Err(GraphError::NotFound(_))));
        assert!(index.is_empty());
    }

    #[test]
    fn data_index_validates_ids() {
        let index = NodeDataIndex::new();
        assert!(matches!(
            index.insert(GraphNodeData::new("", b"x".to_vec())),
            Err(GraphError::InvalidArgument(_))
        ));
        index.insert(GraphNodeData::new("d", b"x".to_vec())).unwrap();
        assert!(matches!(
            index.insert(GraphNodeData::new("d", b"y".to_vec())),
            Err(GraphError::AlreadyExists(_))
        ));
        assert_eq!(index.get("d").unwrap().payload().as_ref(), b"x");
        assert_eq!(index.remove("d").unwrap().id(), "d");
        assert!(matches!(index.get("d"), Err(GraphError::NotFound(_))));
    }

    #[test]
    fn snapshot_reloads_into_fresh_index() {
        let index = NodeDataIndex::new();
        index.insert(GraphNodeData::new("d1", b"one".to_vec())).unwrap();
        index.insert(GraphNodeData::new("d2", b"two".to_vec())).unwrap();
        let snapshot = SortedTable::decode(&index.snapshot().encode()).unwrap();
        let fresh = NodeDataIndex::new();
        fresh.load_snapshot(&snapshot);
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh.get("d2").unwrap().payload().as_ref(), b"two");
    }

    #[test]
    fn partial_snapshot_skips_unknown_ids() {
        let index = NodeDataIndex::new();
        index.insert(GraphNodeData::new("d1", b"one".to_vec())).unwrap();
        index.insert(GraphNodeData::new("d2", b"two".to_vec())).unwrap();
        let delta = index.snapshot_of(["d2", "gone"]);
        assert_eq!(delta.len(), 1);
        assert_eq!(delta.get("d2").unwrap(), b"two");

        assert_eq!(index.retain(|id| id == "d1"), 1);
        assert!(index.get("d1").is_ok());
        assert!(matches!(index.get("d2"), Err(GraphError::NotFound(_))));
    }
}
