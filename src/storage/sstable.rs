use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::node::GraphNodeMeta;
use crate::primitives::bytes::{len_prefixed_size, put_len_prefixed, put_u64, Reader};
use crate::primitives::io::{missing_as_not_found, FileStore};
use crate::types::{GraphError, Result};

/// Immutable, sorted, on-disk key/value file.
///
/// Layout: `[entry_count u64]` followed by `entry_count` entries of
/// `[key_len u64][key][value_len u64][value]`, keys strictly ascending,
/// all integers little-endian. Node tables map node ids to encoded
/// [`GraphNodeMeta`]; data snapshots map data ids to raw payloads.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SortedTable {
    entries: BTreeMap<String, Vec<u8>>,
}

impl SortedTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the encoded `meta` under `node_id`, replacing any prior value.
    pub fn insert(&mut self, node_id: impl Into<String>, meta: &GraphNodeMeta) {
        self.entries.insert(node_id.into(), meta.encode());
    }

    /// Stores raw `value` bytes under `key`.
    pub fn insert_raw(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Raw value stored under `key`.
    pub fn get(&self, key: &str) -> Result<&[u8]> {
        self.entries
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| GraphError::NotFound(format!("key {key}")))
    }

    /// Decoded record stored under `node_id`.
    pub fn get_meta(&self, node_id: &str) -> Result<GraphNodeMeta> {
        GraphNodeMeta::decode(self.get(node_id)?)
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serializes the table.
    pub fn encode(&self) -> Vec<u8> {
        let size = 8 + self
            .entries
            .iter()
            .map(|(k, v)| len_prefixed_size(k.len()) + len_prefixed_size(v.len()))
            .sum::<usize>();
        let mut buf = Vec::with_capacity(size);
        put_u64(&mut buf, self.entries.len() as u64);
        for (key, value) in &self.entries {
            put_len_prefixed(&mut buf, key.as_bytes());
            put_len_prefixed(&mut buf, value);
        }
        buf
    }

    /// Parses a serialized table, rejecting truncation, trailing bytes and
    /// out-of-order keys as `CorruptTable`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(src, "sorted table");
        let count = read_count(&mut reader)?;
        let mut entries = BTreeMap::new();
        let mut last: Option<String> = None;
        for _ in 0..count {
            let key = reader.string()?;
            let value = reader.len_prefixed()?.to_vec();
            if last.as_deref().is_some_and(|prev| prev >= key.as_str()) {
                return Err(GraphError::corrupt(format!(
                    "sorted table key {key} out of order"
                )));
            }
            last = Some(key.clone());
            entries.insert(key, value);
        }
        if !reader.is_exhausted() {
            return Err(GraphError::corrupt("sorted table has trailing bytes"));
        }
        Ok(Self { entries })
    }

    /// Writes the serialized table to `name`.
    pub fn write_to(&self, store: &dyn FileStore, name: &str) -> Result<()> {
        store.write(name, &self.encode())?;
        debug!(file = name, entries = self.len(), "sstable.write");
        Ok(())
    }

    /// Loads the whole table stored at `name`.
    pub fn read_from(store: &dyn FileStore, name: &str) -> Result<Self> {
        let bytes = store
            .read(name)
            .map_err(|err| missing_as_not_found(err, name))?;
        Self::decode(&bytes)
    }

    /// Scans the table stored at `name` for a single key.
    ///
    /// Returns `NotFound` when the file or the key is missing. The whole
    /// file is walked before a value is returned, so truncation, trailing
    /// bytes and out-of-order keys surface as `CorruptTable` whichever key
    /// is asked for.
    pub fn read_key_from(store: &dyn FileStore, name: &str, key: &str) -> Result<Vec<u8>> {
        let bytes = store
            .read(name)
            .map_err(|err| missing_as_not_found(err, name))?;
        let mut reader = Reader::new(&bytes, "sorted table");
        let count = read_count(&mut reader)?;
        let mut found = None;
        let mut last: Option<&[u8]> = None;
        for _ in 0..count {
            let current = reader.len_prefixed()?;
            let value = reader.len_prefixed()?;
            if last.is_some_and(|prev| prev >= current) {
                return Err(GraphError::corrupt(format!(
                    "sorted table {name} keys out of order"
                )));
            }
            last = Some(current);
            if current == key.as_bytes() {
                found = Some(value);
            }
        }
        if !reader.is_exhausted() {
            return Err(GraphError::corrupt(format!(
                "sorted table {name} has trailing bytes"
            )));
        }
        found
            .map(<[u8]>::to_vec)
            .ok_or_else(|| GraphError::NotFound(format!("key {key} in {name}")))
    }
}

fn read_count(reader: &mut Reader<'_>) -> Result<u64> {
    let count = reader.u64()?;
    // Each entry needs two length prefixes.
    if count > (reader.remaining() / 16) as u64 {
        return Err(GraphError::corrupt(format!(
            "sorted table entry count {count} overruns file"
        )));
    }
    Ok(count)
}

/// Shared handle to a table file listed in the manifest.
///
/// Compaction marks replaced tables obsolete; the file is removed when the
/// last reader holding the handle drops it.
pub struct TableHandle {
    name: String,
    entries: usize,
    store: Arc<dyn FileStore>,
    obsolete: AtomicBool,
}

impl TableHandle {
    /// Handle for the table file `name` holding `entries` records.
    pub fn new(store: Arc<dyn FileStore>, name: impl Into<String>, entries: usize) -> Self {
        Self {
            name: name.into(),
            entries,
            store,
            obsolete: AtomicBool::new(false),
        }
    }

    /// File name within the store.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of records, as known when the handle was created.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Record stored for `node_id` in this table, if any.
    pub fn lookup(&self, node_id: &str) -> Result<Option<GraphNodeMeta>> {
        match self.get_raw(node_id) {
            Ok(bytes) => GraphNodeMeta::decode(&bytes).map(Some),
            Err(GraphError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Serialized value stored for `key`.
    pub fn get_raw(&self, key: &str) -> Result<Vec<u8>> {
        SortedTable::read_key_from(self.store.as_ref(), &self.name, key)
    }

    /// Loads the whole table.
    pub fn load(&self) -> Result<SortedTable> {
        SortedTable::read_from(self.store.as_ref(), &self.name)
    }

    /// Schedules the file for deletion once no reader holds this handle.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    /// True once [`TableHandle::mark_obsolete`] was called.
    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }
}

impl Drop for TableHandle {
    fn drop(&mut self) {
        if !self.is_obsolete() {
            return;
        }
        match self.store.remove(&self.name) {
            Ok(()) => debug!(file = %self.name, "sstable.remove"),
            Err(err) => warn!(file = %self.name, error = %err, "sstable.remove_failed"),
        }
    }
}

impl std::fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableHandle")
            .field("name", &self.name)
            .field("entries", &self.entries)
            .field("obsolete", &self.is_obsolete())
            .finish()
    }
}
