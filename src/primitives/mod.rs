//! Low-level primitives for building the storage engine.
//!
//! Includes byte utilities, file storage, concurrency controls and the
//! merge log.

/// Byte-level utilities and encoding/decoding.
///
/// Little-endian writers and a bounds-checked reader for the on-disk formats.
pub mod bytes;

/// Concurrency primitives and synchronization.
///
/// Per-node locks and the background task scheduler.
pub mod concurrency;

/// File storage abstractions.
///
/// The [`io::FileStore`] capability with directory and in-memory backends.
pub mod io;

/// Merge log for crash recovery.
///
/// Ensures durability through sequential logging of every metadata delta
/// and payload.
pub mod wal;
