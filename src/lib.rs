//! Embedded LSM storage engine for a directed property graph.
//!
//! Nodes carry an opaque payload and a list of directed, flagged
//! connections. Writes land in an in-memory [`storage::memtable::Memtable`]
//! and an append-only merge log; full memtables are frozen and persisted as
//! immutable sorted tables, which compaction periodically merges into one.
//! Reads resolve a node across every level, newest first, behind an LRU
//! object cache.
//!
//! ```no_run
//! use lsmgraph::StorageEngine;
//!
//! # fn main() -> lsmgraph::Result<()> {
//! let engine = StorageEngine::open_in_memory()?;
//! let alice = engine.create_node_in_class("user", b"alice".to_vec())?;
//! let bob = engine.create_node_in_class("user", b"bob".to_vec())?;
//! engine.add_connection(&alice, &bob)?;
//! assert_eq!(engine.match_connections(&alice, "user")?, vec![bob]);
//! engine.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod db;
pub mod primitives;
pub mod storage;
pub mod types;

pub use db::{
    sanitize_prefix, CompactionManager, CompactionOutcome, EngineBuilder, EngineConfig,
    EngineStats, FlushOutcome, FlushingManager, StorageEngine,
};
pub use primitives::io::{DirStore, FileStore, MemStore};
pub use primitives::wal::SyncMode;
pub use storage::ids::{IdentifierSource, RandomIds, SequentialIds};
pub use storage::metrics::{CounterMetrics, EngineMetrics, NoopMetrics};
pub use types::{GraphError, Result};
