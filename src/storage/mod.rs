//! Graph data model and the storage structures built on it.
//!
//! Holds the node metadata codec and the cross-level resolution rules, the
//! in-memory and on-disk tables, the caches and indices the engine reads
//! through, and the manifest describing persisted files.

/// Payload and connection-list cache.
pub mod cache;

/// Node and data identifier sources.
pub mod ids;

/// Live node ids and stored payloads.
pub mod indices;

/// Durable list of live files.
pub mod manifest;

/// Size-bounded in-memory table of metadata deltas.
pub mod memtable;

/// Engine metrics sinks.
pub mod metrics;

/// Node metadata, payloads and their binary encoding.
pub mod node;

/// Immutable sorted tables on disk.
pub mod sstable;

pub use cache::{CacheKey, CacheStats, CachedValue, ObjectCache};
pub use indices::{NodeDataIndex, NodeIdIndex};
pub use memtable::Memtable;
pub use node::{Connection, EdgeFlag, GraphNodeData, GraphNodeMeta};
pub use sstable::{SortedTable, TableHandle};
