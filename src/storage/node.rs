use std::fmt;

use bytes::Bytes;
use rustc_hash::FxHashSet;

use crate::primitives::bytes::{len_prefixed_size, put_len_prefixed, put_u64, Reader};
use crate::types::{GraphError, Result};

const META_FLAG_TOMBSTONE: u8 = 0x01;
const META_FLAG_MASK: u8 = META_FLAG_TOMBSTONE;

/// Liveness flag carried by every connection entry.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum EdgeFlag {
    /// Tombstoned edge: shadows older live entries for the same target.
    Deleted = 0,
    /// Live directed edge.
    Live = 1,
}

impl EdgeFlag {
    /// Wire byte for this flag.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a wire byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(EdgeFlag::Deleted),
            1 => Ok(EdgeFlag::Live),
            other => Err(GraphError::corrupt(format!("unknown edge flag {other}"))),
        }
    }

    /// True for [`EdgeFlag::Live`].
    pub const fn is_live(self) -> bool {
        matches!(self, EdgeFlag::Live)
    }
}

/// One `(target, flag)` entry of a node's connection list.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Connection {
    /// Node the edge points at.
    pub target: String,
    /// Whether this entry adds or removes the edge.
    pub flag: EdgeFlag,
}

/// Per-node metadata record stored in memtables, sorted tables and the merge log.
///
/// A record is a *delta*: a data pointer, a set of connection entries keyed
/// by `(target, flag)`, or a tombstone. Entries keep their insertion order so
/// that the last entry for a target is that level's verdict.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GraphNodeMeta {
    data_pointer: String,
    connections: Vec<Connection>,
    tombstone: bool,
}

impl GraphNodeMeta {
    /// Empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record pointing at the payload stored under `data_id`.
    pub fn with_data(data_id: impl Into<String>) -> Self {
        Self {
            data_pointer: data_id.into(),
            ..Self::default()
        }
    }

    /// Record carrying a single connection entry.
    pub fn with_connection(target: impl Into<String>, flag: EdgeFlag) -> Self {
        let mut meta = Self::default();
        meta.add_connection(target, flag);
        meta
    }

    /// Deletion marker: empty data pointer plus the tombstone bit.
    pub fn tombstone() -> Self {
        Self {
            tombstone: true,
            ..Self::default()
        }
    }

    /// Data pointer, empty when this record does not carry one.
    pub fn data_id(&self) -> &str {
        &self.data_pointer
    }

    /// True when this record marks the node deleted.
    pub fn is_tombstone(&self) -> bool {
        self.tombstone
    }

    /// Records `(target, flag)`. Re-adding an existing pair moves it to the end.
    pub fn add_connection(&mut self, target: impl Into<String>, flag: EdgeFlag) {
        let target = target.into();
        self.connections
            .retain(|c| !(c.flag == flag && c.target == target));
        self.connections.push(Connection { target, flag });
    }

    /// Connection entries in insertion order.
    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// This level's verdict for `target`: the flag of its latest entry.
    pub fn verdict(&self, target: &str) -> Option<EdgeFlag> {
        self.connections
            .iter()
            .rev()
            .find(|c| c.target == target)
            .map(|c| c.flag)
    }

    /// Layers a newer record on top of this one.
    ///
    /// A tombstone clears the record and stays put; later deltas cannot
    /// revive it.
    pub fn absorb(&mut self, newer: &GraphNodeMeta) {
        if self.tombstone {
            return;
        }
        if newer.tombstone {
            *self = Self::tombstone();
            return;
        }
        if !newer.data_pointer.is_empty() {
            self.data_pointer.clone_from(&newer.data_pointer);
        }
        for conn in &newer.connections {
            self.add_connection(conn.target.clone(), conn.flag);
        }
    }

    /// Collapses the record to one live entry per target.
    ///
    /// Only valid when no older level remains below this record, since the
    /// dropped `Deleted` entries no longer shadow anything.
    pub fn compact(&mut self) {
        let mut seen = FxHashSet::default();
        let mut kept = Vec::with_capacity(self.connections.len());
        for conn in self.connections.drain(..).rev() {
            if seen.insert(conn.target.clone()) && conn.flag.is_live() {
                kept.push(conn);
            }
        }
        kept.reverse();
        self.connections = kept;
    }

    /// True when the record carries neither data, connections nor a tombstone.
    pub fn is_empty(&self) -> bool {
        !self.tombstone && self.data_pointer.is_empty() && self.connections.is_empty()
    }

    /// Length of [`GraphNodeMeta::encode`]'s output.
    pub fn encoded_len(&self) -> usize {
        1 + len_prefixed_size(self.data_pointer.len())
            + 8
            + self
                .connections
                .iter()
                .map(|c| len_prefixed_size(c.target.len()) + 1)
                .sum::<usize>()
    }

    /// Serializes the record:
    /// `[flags u8][data_ptr][conn_count u64]{[target][flag u8]}*`,
    /// strings being `u64`-length-prefixed.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(if self.tombstone { META_FLAG_TOMBSTONE } else { 0 });
        put_len_prefixed(&mut buf, self.data_pointer.as_bytes());
        put_u64(&mut buf, self.connections.len() as u64);
        for conn in &self.connections {
            put_len_prefixed(&mut buf, conn.target.as_bytes());
            buf.push(conn.flag.as_u8());
        }
        buf
    }

    /// Parses bytes produced by [`GraphNodeMeta::encode`].
    pub fn decode(src: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(src, "node meta");
        let flags = reader.u8()?;
        if flags & !META_FLAG_MASK != 0 {
            return Err(GraphError::corrupt(format!(
                "node meta has unknown flag bits {flags:#04x}"
            )));
        }
        let data_pointer = reader.string()?;
        let count = reader.u64()?;
        // Each entry needs at least a length prefix and a flag byte.
        if count > (reader.remaining() / 9) as u64 {
            return Err(GraphError::corrupt("node meta connection count overruns"));
        }
        let mut connections = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let target = reader.string()?;
            let flag = EdgeFlag::from_u8(reader.u8()?)?;
            connections.push(Connection { target, flag });
        }
        if !reader.is_exhausted() {
            return Err(GraphError::corrupt("node meta has trailing bytes"));
        }
        Ok(Self {
            data_pointer,
            connections,
            tombstone: flags & META_FLAG_TOMBSTONE != 0,
        })
    }
}

/// Opaque payload owned by whichever index currently holds it.
#[derive(Clone, Eq, PartialEq)]
pub struct GraphNodeData {
    id: String,
    payload: Bytes,
}

impl GraphNodeData {
    /// Wraps `payload` under the data id `id`.
    pub fn new(id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }

    /// Data id the payload is addressed by.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Payload bytes; cloning is cheap.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the record, returning the payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

impl fmt::Debug for GraphNodeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphNodeData")
            .field("id", &self.id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Resolves the data pointer visible through `levels`, ordered newest first.
///
/// Returns `None` when the newest decisive record is a tombstone or no
/// level carries a pointer.
pub fn resolve_data_pointer<'a, I>(levels: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a GraphNodeMeta>,
{
    for meta in levels {
        if meta.is_tombstone() {
            return None;
        }
        if !meta.data_id().is_empty() {
            return Some(meta.data_id());
        }
    }
    None
}

/// Live connection targets visible through `levels`, ordered newest first.
///
/// The newest level mentioning a target decides it; a tombstone hides
/// every older level. Targets come back sorted.
pub fn resolve_connections<'a, I>(levels: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a GraphNodeMeta>,
{
    let mut decided: FxHashSet<&'a str> = FxHashSet::default();
    let mut live = Vec::new();
    for meta in levels {
        if meta.is_tombstone() {
            break;
        }
        for conn in meta.connections().iter().rev() {
            if decided.insert(conn.target.as_str()) && conn.flag.is_live() {
                live.push(conn.target.clone());
            }
        }
    }
    live.sort_unstable();
    live
}
