use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::primitives::io::{missing_as_not_found, FileStore};
use crate::types::{GraphError, Result};

/// Name of the manifest file within the store.
pub const MANIFEST_NAME: &str = "MANIFEST";

const MANIFEST_FORMAT: u32 = 1;

/// File name of the node table with sequence number `seq`.
pub fn table_name(seq: u64) -> String {
    format!("sst-{seq:06}.sst")
}

/// File name of the payload snapshot with sequence number `seq`.
pub fn snapshot_name(seq: u64) -> String {
    format!("data-{seq:06}.sst")
}

/// Durable list of the files that make up the engine state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// On-disk format version.
    pub format: u32,
    /// Next unused file sequence number.
    pub next_file: u64,
    /// Live node tables, oldest first.
    pub tables: Vec<String>,
    /// Full payload snapshot written by the last compaction, if any.
    pub data_snapshot: Option<String>,
    /// Payloads persisted by flushes since that snapshot, oldest first.
    #[serde(default)]
    pub data_deltas: Vec<String>,
    /// Merge-log segments not yet covered by a table, oldest first.
    pub log_segments: Vec<u64>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            format: MANIFEST_FORMAT,
            next_file: 1,
            tables: Vec::new(),
            data_snapshot: None,
            data_deltas: Vec::new(),
            log_segments: Vec::new(),
        }
    }
}

impl Manifest {
    /// Loads the manifest; `None` for a store that never held one.
    pub fn load(store: &dyn FileStore) -> Result<Option<Self>> {
        let bytes = match store
            .read(MANIFEST_NAME)
            .map_err(|err| missing_as_not_found(err, MANIFEST_NAME))
        {
            Ok(bytes) => bytes,
            Err(GraphError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        if manifest.format != MANIFEST_FORMAT {
            return Err(GraphError::corrupt(format!(
                "unsupported manifest format {}",
                manifest.format
            )));
        }
        Ok(Some(manifest))
    }

    /// Atomically replaces the stored manifest.
    pub fn persist(&self, store: &dyn FileStore) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        store.write(MANIFEST_NAME, &bytes)?;
        debug!(
            tables = self.tables.len(),
            segments = self.log_segments.len(),
            next_file = self.next_file,
            "manifest.persist"
        );
        Ok(())
    }

    /// Reserves the next file sequence number.
    pub fn allocate(&mut self) -> u64 {
        let seq = self.next_file;
        self.next_file += 1;
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemStore;

    #[test]
    fn missing_manifest_loads_as_none() {
        let store = MemStore::new();
        assert!(Manifest::load(&store).unwrap().is_none());
    }

    #[test]
    fn persist_then_load() -> Result<()> {
        let store = MemStore::new();
        let mut manifest = Manifest::default();
        let seq = manifest.allocate();
        manifest.tables.push(table_name(seq));
        let log_seq = manifest.allocate();
        manifest.log_segments.push(log_seq);
        manifest.persist(&store)?;
        let loaded = Manifest::load(&store)?.expect("manifest");
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.tables, vec!["sst-000001.sst".to_string()]);
        assert_eq!(loaded.next_file, 3);
        Ok(())
    }

    #[test]
    fn manifest_without_deltas_still_loads() -> Result<()> {
        let store = MemStore::new();
        let json = r#"{"format":1,"next_file":4,"tables":["sst-000002.sst"],
            "data_snapshot":"data-000003.sst","log_segments":[1]}"#;
        store.write(MANIFEST_NAME, json.as_bytes())?;
        let loaded = Manifest::load(&store)?.expect("manifest");
        assert!(loaded.data_deltas.is_empty());
        assert_eq!(loaded.data_snapshot.as_deref(), Some("data-000003.sst"));
        Ok(())
    }

    #[test]
    fn garbage_manifest_is_corrupt() {
        let store = MemStore::new();
        store.write(MANIFEST_NAME, b"{not json").unwrap();
        assert!(matches!(
            Manifest::load(&store),
            Err(GraphError::CorruptTable(_))
        ));
    }
}
