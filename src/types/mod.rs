#![forbid(unsafe_code)]
//! Shared error taxonomy and small value types used across the engine.

use std::io;

use thiserror::Error;

pub mod checksum;

pub use checksum::{crc32, Checksum, Crc32Fast};

/// Errors produced by every layer of the engine.
///
/// Index- and table-level code reports `NotFound` and `AlreadyExists`
/// precisely; [`GraphError::into_engine`] folds them into
/// `InvalidArgument` at the public engine boundary.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Propagated from the underlying [`FileStore`](crate::primitives::io::FileStore).
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// On-disk format violation in a sorted table, snapshot or manifest.
    #[error("corrupt table: {0}")]
    CorruptTable(String),
    /// Caller supplied an argument the engine cannot act on.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Key already present in an index.
    #[error("{0} already exists")]
    AlreadyExists(String),
    /// Key absent from an index or table.
    #[error("{0} not found")]
    NotFound(String),
    /// The memtable filled up; the write was rejected and must be retried.
    #[error("memtable capacity exceeded: entry of {entry} bytes over capacity {capacity}")]
    CapacityExceeded {
        /// Configured memtable capacity in bytes.
        capacity: usize,
        /// Approximate cost of the rejected entry.
        entry: usize,
    },
    /// The memtable froze before this write reached it.
    #[error("memtable is frozen")]
    MemtableFrozen,
    /// The engine or scheduler no longer accepts work.
    #[error("shut down: {0}")]
    Shutdown(&'static str),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GraphError>;

impl GraphError {
    /// Translates an index/table error into the error surfaced to engine callers.
    pub fn into_engine(self) -> Self {
        match self {
            GraphError::NotFound(what) => {
                GraphError::InvalidArgument(format!("{what} does not exist"))
            }
            GraphError::AlreadyExists(what) => {
                GraphError::InvalidArgument(format!("{what} already exists"))
            }
            other => other,
        }
    }

    /// Returns true for the backpressure signals a writer may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GraphError::CapacityExceeded { .. } | GraphError::MemtableFrozen
        )
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        GraphError::CorruptTable(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        GraphError::InvalidArgument(msg.into())
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        GraphError::CorruptTable(format!("manifest: {err}"))
    }
}
