#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use lsmgraph::{EngineConfig, FileStore, GraphError, MemStore, Result, SequentialIds, StorageEngine};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lsmgraph=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

/// Deterministic config: small memtables, no background jobs.
pub fn manual_config(memtable_capacity: usize) -> EngineConfig {
    EngineConfig::default()
        .memtable_capacity(memtable_capacity)
        .worker_threads(1)
        .background_maintenance(false)
}

pub fn open_engine(store: &Arc<MemStore>, config: EngineConfig) -> StorageEngine {
    init_tracing();
    StorageEngine::builder(store.clone())
        .config(config)
        .ids(Arc::new(SequentialIds::default()))
        .open()
        .expect("open engine")
}

/// Reopens over an existing store; ids start at `first_id` so they do not
/// collide with ids handed out before the restart.
pub fn reopen_engine(store: &Arc<MemStore>, config: EngineConfig, first_id: u64) -> StorageEngine {
    init_tracing();
    StorageEngine::builder(store.clone())
        .config(config)
        .ids(Arc::new(SequentialIds::starting_at(first_id)))
        .open()
        .expect("reopen engine")
}

/// [`MemStore`] whose appends can be switched to fail, as on a full disk.
pub struct FlakyStore {
    inner: Arc<MemStore>,
    fail_appends: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemStore>) -> Self {
        Self {
            inner,
            fail_appends: AtomicBool::new(false),
        }
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }
}

impl FileStore for FlakyStore {
    fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.inner.write(path, bytes)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.read(path)
    }

    fn append(&self, path: &str, bytes: &[u8]) -> Result<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(GraphError::Io(io::Error::other("disk full")));
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
