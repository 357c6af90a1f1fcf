#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::primitives::bytes::{put_len_prefixed, put_u32, Reader};
use crate::primitives::io::{missing_as_not_found, FileStore};
use crate::storage::node::{GraphNodeData, GraphNodeMeta};
use crate::types::{crc32, GraphError, Result};

const FRAME_HEADER_LEN: usize = 8;
const RECORD_META: u8 = 1;
const RECORD_DATA: u8 = 2;

/// File name of the merge-log segment with sequence number `seq`.
pub fn segment_name(seq: u64) -> String {
    format!("wal-{seq:06}.log")
}

/// When appended records reach stable storage.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Every append is written and synced before it returns.
    #[default]
    Immediate,
    /// Appends buffer in memory until `batch_entries` records accumulate
    /// or [`MergeLog::flush_to_disk`] is called.
    Batched,
}

/// Options for [`MergeLog::open`].
#[derive(Clone, Copy, Debug)]
pub struct MergeLogOptions {
    /// Sync policy.
    pub sync_mode: SyncMode,
    /// Records buffered before a batched flush.
    pub batch_entries: usize,
}

impl Default for MergeLogOptions {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::Immediate,
            batch_entries: 64,
        }
    }
}

/// Counters describing merge-log activity.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MergeLogStats {
    /// Records accepted by `append*`.
    pub records_appended: u64,
    /// Framed bytes written to segments.
    pub bytes_written: u64,
    /// Write-and-sync passes.
    pub flushes: u64,
    /// Segment switches.
    pub rotations: u64,
}

/// One replayable merge-log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogRecord {
    /// A metadata delta for `node_id`.
    Meta {
        /// Node the delta applies to.
        node_id: String,
        /// The delta itself.
        meta: GraphNodeMeta,
    },
    /// A payload written by node creation.
    Data(GraphNodeData),
}

impl LogRecord {
    fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            LogRecord::Meta { node_id, meta } => {
                body.push(RECORD_META);
                put_len_prefixed(&mut body, node_id.as_bytes());
                put_len_prefixed(&mut body, &meta.encode());
            }
            LogRecord::Data(data) => {
                body.push(RECORD_DATA);
                put_len_prefixed(&mut body, data.id().as_bytes());
                put_len_prefixed(&mut body, data.payload());
            }
        }
        body
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(body, "merge log record");
        let record = match reader.u8()? {
            RECORD_META => {
                let node_id = reader.string()?;
                let meta = GraphNodeMeta::decode(reader.len_prefixed()?)?;
                LogRecord::Meta { node_id, meta }
            }
            RECORD_DATA => {
                let id = reader.string()?;
                let payload = reader.len_prefixed()?.to_vec();
                LogRecord::Data(GraphNodeData::new(id, payload))
            }
            other => {
                return Err(GraphError::corrupt(format!(
                    "unknown merge log record kind {other}"
                )))
            }
        };
        if !reader.is_exhausted() {
            return Err(GraphError::corrupt("merge log record has trailing bytes"));
        }
        Ok(record)
    }

    /// Frames the record: `[body_len u32][crc32 u32][body]`.
    pub fn encode(&self) -> Vec<u8> {
        let body = self.encode_body();
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        put_u32(&mut frame, body.len() as u32);
        put_u32(&mut frame, crc32(&[&body]));
        frame.extend_from_slice(&body);
        frame
    }
}

struct LogState {
    segment: u64,
    pending: Vec<u8>,
    pending_records: usize,
    stats: MergeLogStats,
}

/// Append-only, segmented log of every metadata delta and payload.
///
/// Each memtable owns one segment; [`MergeLog::rotate`] switches segments
/// when the engine swaps memtables. Appends are serialized so records land
/// in the order they were accepted.
pub struct MergeLog {
    store: Arc<dyn FileStore>,
    options: MergeLogOptions,
    state: Mutex<LogState>,
}

impl MergeLog {
    /// Opens the log appending to segment `segment`.
    pub fn open(store: Arc<dyn FileStore>, segment: u64, options: MergeLogOptions) -> Self {
        Self {
            store,
            options: MergeLogOptions {
                batch_entries: options.batch_entries.max(1),
                ..options
            },
            state: Mutex::new(LogState {
                segment,
                pending: Vec::new(),
                pending_records: 0,
                stats: MergeLogStats::default(),
            }),
        }
    }

    /// Appends a metadata delta for `node_id`.
    pub fn append(&self, node_id: &str, meta: &GraphNodeMeta) -> Result<()> {
        self.append_record(&LogRecord::Meta {
            node_id: node_id.to_owned(),
            meta: meta.clone(),
        })
    }

    /// Appends `record`, honoring the sync mode.
    pub fn append_record(&self, record: &LogRecord) -> Result<()> {
        self.append_all(std::slice::from_ref(record))
    }

    /// Appends `records` as one unit, honoring the sync mode.
    ///
    /// If the write they trigger fails, none of them stays buffered, so a
    /// rejected append never reaches the segment on a later flush.
    pub fn append_all(&self, records: &[LogRecord]) -> Result<()> {
        let mut state = self.state.lock();
        let mark = (state.pending.len(), state.pending_records);
        for record in records {
            state.pending.extend_from_slice(&record.encode());
            state.pending_records += 1;
        }
        let due = match self.options.sync_mode {
            SyncMode::Immediate => true,
            SyncMode::Batched => state.pending_records >= self.options.batch_entries,
        };
        if due {
            if let Err(err) = self.write_pending(&mut state) {
                state.pending.truncate(mark.0);
                state.pending_records = mark.1;
                return Err(err);
            }
        }
        state.stats.records_appended += records.len() as u64;
        Ok(())
    }

    /// Writes and syncs every buffered record.
    pub fn flush_to_disk(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.write_pending(&mut state)
    }

    fn write_pending(&self, state: &mut LogState) -> Result<()> {
        if state.pending.is_empty() {
            return Ok(());
        }
        let name = segment_name(state.segment);
        self.store.append(&name, &state.pending)?;
        self.store.sync(&name)?;
        trace!(
            segment = state.segment,
            records = state.pending_records,
            bytes = state.pending.len(),
            "merge_log.flush"
        );
        state.stats.bytes_written += state.pending.len() as u64;
        state.stats.flushes += 1;
        state.pending.clear();
        state.pending_records = 0;
        Ok(())
    }

    /// Flushes the current segment and continues in `next`, returning the
    /// sequence number of the segment just closed.
    pub fn rotate(&self, next: u64) -> Result<u64> {
        let mut state = self.state.lock();
        self.write_pending(&mut state)?;
        let previous = std::mem::replace(&mut state.segment, next);
        state.stats.rotations += 1;
        debug!(previous, next, "merge_log.rotate");
        Ok(previous)
    }

    /// Sequence number of the segment receiving appends.
    pub fn segment(&self) -> u64 {
        self.state.lock().segment
    }

    /// Snapshot of the log counters.
    pub fn stats(&self) -> MergeLogStats {
        self.state.lock().stats
    }

    /// Deletes the file of a segment whose contents became durable elsewhere.
    pub fn remove_segment(store: &dyn FileStore, seq: u64) -> Result<()> {
        store.remove(&segment_name(seq))
    }

    /// Decodes every intact record of a serialized segment.
    ///
    /// Replay stops silently at a torn tail (short header, short body or
    /// checksum mismatch). A checksummed record that fails to decode is
    /// reported as `CorruptTable`.
    pub fn replay(bytes: &[u8]) -> Result<Vec<LogRecord>> {
        let mut iter = LogIterator::new(bytes);
        let mut records = Vec::new();
        while let Some(record) = iter.next_record()? {
            records.push(record);
        }
        if iter.valid_up_to() < bytes.len() {
            warn!(
                valid = iter.valid_up_to(),
                len = bytes.len(),
                "merge_log.torn_tail"
            );
        }
        Ok(records)
    }

    /// Replays segment `seq`; a missing segment replays as empty.
    pub fn replay_segment(store: &dyn FileStore, seq: u64) -> Result<Vec<LogRecord>> {
        let name = segment_name(seq);
        match store.read(&name).map_err(|err| missing_as_not_found(err, &name)) {
            Ok(bytes) => Self::replay(&bytes),
            Err(GraphError::NotFound(_)) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }
}

impl Drop for MergeLog {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Err(err) = self.write_pending(&mut state) {
            warn!(error = %err, "merge_log.drop_flush_failed");
        }
    }
}

/// Walks the framed records of one segment.
pub struct LogIterator<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> LogIterator<'a> {
    /// Iterator over the serialized segment `bytes`.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    /// Next intact record, or `None` at the end or at a torn tail.
    pub fn next_record(&mut self) -> Result<Option<LogRecord>> {
        let rest = &self.bytes[self.offset..];
        if rest.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let mut header = Reader::new(&rest[..FRAME_HEADER_LEN], "merge log frame");
        let body_len = header.u32()? as usize;
        let stored_crc = header.u32()?;
        let Some(body) = rest.get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + body_len) else {
            return Ok(None);
        };
        if crc32(&[body]) != stored_crc {
            return Ok(None);
        }
        let record = LogRecord::decode_body(body)?;
        self.offset += FRAME_HEADER_LEN + body_len;
        Ok(Some(record))
    }

    /// Offset just past the last intact record.
    pub fn valid_up_to(&self) -> usize {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::primitives::io::MemStore;
    use crate::storage::node::EdgeFlag;

    fn log(store: &Arc<MemStore>, mode: SyncMode, batch: usize) -> MergeLog {
        MergeLog::open(
            store.clone(),
            1,
            MergeLogOptions {
                sync_mode: mode,
                batch_entries: batch,
            },
        )
    }

    #[test]
    fn replay_returns_records_in_append_order() -> Result<()> {
        let store = Arc::new(MemStore::new());
        let wal = log(&store, SyncMode::Immediate, 1);
        wal.append_record(&LogRecord::Data(GraphNodeData::new("d1", b"hello".to_vec())))?;
        wal.append("n1", &GraphNodeMeta::with_data("d1"))?;
        wal.append("n1", &GraphNodeMeta::with_connection("n2", EdgeFlag::Live))?;
        let records = MergeLog::replay_segment(store.as_ref(), 1)?;
        assert_eq!(records.len(), 3);
        assert!(matches!(&records[0], LogRecord::Data(d) if d.id() == "d1"));
        assert!(
            matches!(&records[2], LogRecord::Meta { node_id, meta } if node_id == "n1" && meta.verdict("n2") == Some(EdgeFlag::Live))
        );
        Ok(())
    }

    #[test]
    fn batched_mode_buffers_until_threshold() -> Result<()> {
        let store = Arc::new(MemStore::new());
        let wal = log(&store, SyncMode::Batched, 3);
        wal.append("a", &GraphNodeMeta::with_data("d"))?;
        wal.append("b", &GraphNodeMeta::with_data("d"))?;
        assert!(!store.exists(&segment_name(1))?);
        wal.append("c", &GraphNodeMeta::with_data("d"))?;
        assert_eq!(MergeLog::replay_segment(store.as_ref(), 1)?.len(), 3);
        wal.append("d", &GraphNodeMeta::with_data("d"))?;
        wal.flush_to_disk()?;
        assert_eq!(MergeLog::replay_segment(store.as_ref(), 1)?.len(), 4);
        assert_eq!(wal.stats().records_appended, 4);
        Ok(())
    }

    struct FailingAppends {
        inner: MemStore,
        fail: AtomicBool,
    }

    impl FileStore for FailingAppends {
        fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
            self.inner.write(path, bytes)
        }
        fn read(&self, path: &str) -> Result<Vec<u8>> {
            self.inner.read(path)
        }
        fn append(&self, path: &str, bytes: &[u8]) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(GraphError::Io(std::io::Error::other("disk full")));
            }
            self.inner.append(path, bytes)
        }
        fn sync(&self, path: &str) -> Result<()> {
            self.inner.sync(path)
        }
        fn remove(&self, path: &str) -> Result<()> {
            self.inner.remove(path)
        }
        fn exists(&self, path: &str) -> Result<bool> {
            self.inner.exists(path)
        }
    }

    #[test]
    fn failed_append_is_not_written_later() -> Result<()> {
        let store = Arc::new(FailingAppends {
            inner: MemStore::new(),
            fail: AtomicBool::new(false),
        });
        let wal = MergeLog::open(store.clone(), 1, MergeLogOptions::default());
        wal.append("a", &GraphNodeMeta::with_data("d1"))?;
        store.fail.store(true, Ordering::SeqCst);
        let pair = [
            LogRecord::Data(GraphNodeData::new("d2", b"x".to_vec())),
            LogRecord::Meta {
                node_id: "b".into(),
                meta: GraphNodeMeta::with_data("d2"),
            },
        ];
        assert!(matches!(wal.append_all(&pair), Err(GraphError::Io(_))));
        store.fail.store(false, Ordering::SeqCst);
        wal.append("c", &GraphNodeMeta::with_data("d3"))?;

        let records = MergeLog::replay_segment(store.as_ref(), 1)?;
        let keys: Vec<&str> = records
            .iter()
            .filter_map(|record| match record {
                LogRecord::Meta { node_id, .. } => Some(node_id.as_str()),
                LogRecord::Data(_) => None,
            })
            .collect();
        assert_eq!(keys, vec!["a", "c"]);
        assert_eq!(records.len(), 2);
        assert_eq!(wal.stats().records_appended, 2);
        Ok(())
    }

    #[test]
    fn torn_tail_is_dropped() -> Result<()> {
        let store = Arc::new(MemStore::new());
        let wal = log(&store, SyncMode::Immediate, 1);
        wal.append("a", &GraphNodeMeta::with_data("d1"))?;
        wal.append("b", &GraphNodeMeta::with_data("d2"))?;
        let name = segment_name(1);
        let len = store.file_len(&name).expect("segment");
        store.truncate(&name, len - 2)?;
        let records = MergeLog::replay_segment(store.as_ref(), 1)?;
        assert_eq!(records.len(), 1);
        Ok(())
    }

    #[test]
    fn checksum_mismatch_stops_replay() {
        let mut bytes = LogRecord::Meta {
            node_id: "a".into(),
            meta: GraphNodeMeta::with_data("d"),
        }
        .encode();
        bytes.extend(
            LogRecord::Meta {
                node_id: "b".into(),
                meta: GraphNodeMeta::with_data("d"),
            }
            .encode(),
        );
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let records = MergeLog::replay(&bytes).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn rotate_switches_segments() -> Result<()> {
        let store = Arc::new(MemStore::new());
        let wal = log(&store, SyncMode::Batched, 64);
        wal.append("a", &GraphNodeMeta::with_data("d"))?;
        assert_eq!(wal.rotate(2)?, 1);
        wal.append("b", &GraphNodeMeta::with_data("d"))?;
        wal.flush_to_disk()?;
        assert_eq!(MergeLog::replay_segment(store.as_ref(), 1)?.len(), 1);
        assert_eq!(MergeLog::replay_segment(store.as_ref(), 2)?.len(), 1);
        MergeLog::remove_segment(store.as_ref(), 1)?;
        assert!(MergeLog::replay_segment(store.as_ref(), 1)?.is_empty());
        Ok(())
    }
}
