use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::node::GraphNodeMeta;
use super::sstable::SortedTable;
use crate::types::{GraphError, Result};

/// Fixed cost charged per insert on top of the key length.
pub const ENTRY_OVERHEAD: usize = std::mem::size_of::<GraphNodeMeta>();

/// Default capacity of a memtable in bytes.
pub const DEFAULT_MEMTABLE_CAPACITY: usize = 1024 * 1024;

/// Thread-safe, size-bounded, ordered table of pending node metadata.
///
/// Once the running size would exceed the capacity the table freezes as
/// part of the rejected insert and never accepts another write.
pub struct Memtable {
    table: Mutex<BTreeMap<String, GraphNodeMeta>>,
    capacity: usize,
    size: AtomicUsize,
    frozen: AtomicBool,
    flush_needed: Condvar,
}

impl Memtable {
    /// Creates an empty, open memtable bounded at `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Mutex::new(BTreeMap::new()),
            capacity,
            size: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
            flush_needed: Condvar::new(),
        }
    }

    /// Approximate cost of inserting `meta` under `node_id`.
    pub fn entry_cost(node_id: &str, _meta: &GraphNodeMeta) -> usize {
        node_id.len() + ENTRY_OVERHEAD
    }

    /// Layers `meta` onto the record stored under `node_id`.
    ///
    /// Fails with `MemtableFrozen` after the table froze. A write that would
    /// overflow the capacity freezes the table, is rejected with
    /// `CapacityExceeded`, and wakes [`Memtable::wait_frozen`] callers. An
    /// entry larger than the whole capacity is rejected without freezing an
    /// empty table.
    pub fn insert(&self, node_id: impl Into<String>, meta: GraphNodeMeta) -> Result<()> {
        if self.is_frozen() {
            return Err(GraphError::MemtableFrozen);
        }
        let node_id = node_id.into();
        let cost = Self::entry_cost(&node_id, &meta);
        let mut table = self.table.lock();
        let size = self.admit(&table, cost)?;
        match table.entry(node_id) {
            Entry::Occupied(mut slot) => slot.get_mut().absorb(&meta),
            Entry::Vacant(slot) => {
                slot.insert(meta);
            }
        }
        self.size.store(size + cost, Ordering::Release);
        Ok(())
    }

    /// Runs the admission check of [`Memtable::insert`] without storing
    /// anything: same errors, same freeze on overflow. While no other insert
    /// runs in between, the matching `insert` then succeeds.
    pub fn reserve(&self, node_id: &str, meta: &GraphNodeMeta) -> Result<()> {
        if self.is_frozen() {
            return Err(GraphError::MemtableFrozen);
        }
        let table = self.table.lock();
        self.admit(&table, Self::entry_cost(node_id, meta)).map(|_| ())
    }

    /// Caller holds the table lock. Returns the current size.
    fn admit(&self, table: &BTreeMap<String, GraphNodeMeta>, cost: usize) -> Result<usize> {
        if self.is_frozen() {
            return Err(GraphError::MemtableFrozen);
        }
        let size = self.size.load(Ordering::Acquire);
        if size + cost > self.capacity {
            if !table.is_empty() {
                self.frozen.store(true, Ordering::Release);
                self.flush_needed.notify_all();
            }
            return Err(GraphError::CapacityExceeded {
                capacity: self.capacity,
                entry: cost,
            });
        }
        Ok(size)
    }

    /// Freezes the table; returns false if it was already frozen.
    pub fn freeze(&self) -> bool {
        let _table = self.table.lock();
        let newly = !self.frozen.swap(true, Ordering::AcqRel);
        if newly {
            self.flush_needed.notify_all();
        }
        newly
    }

    /// Blocks up to `timeout` for the table to freeze.
    pub fn wait_frozen(&self, timeout: Duration) -> bool {
        let mut table = self.table.lock();
        if self.is_frozen() {
            return true;
        }
        let _ = self.flush_needed.wait_for(&mut table, timeout);
        self.is_frozen()
    }

    /// Record stored under `node_id`, if any.
    pub fn get(&self, node_id: &str) -> Option<GraphNodeMeta> {
        self.table.lock().get(node_id).cloned()
    }

    /// All entries, sorted by node id.
    pub fn entries(&self) -> Vec<(String, GraphNodeMeta)> {
        self.table
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Node ids present, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.table.lock().keys().cloned().collect()
    }

    /// Builds a sorted table holding every entry's serialized record.
    pub fn dump(&self) -> SortedTable {
        let table = self.table.lock();
        let mut out = SortedTable::new();
        for (node_id, meta) in table.iter() {
            out.insert(node_id.clone(), meta);
        }
        out
    }

    /// Number of distinct node ids.
    pub fn count(&self) -> usize {
        self.table.lock().len()
    }

    /// True when no entry has been written.
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Running byte-size counter.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Configured capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True once the table stopped accepting writes.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("size", &self.size())
            .field("capacity", &self.capacity)
            .field("frozen", &self.is_frozen())
            .finish()
    }
}
