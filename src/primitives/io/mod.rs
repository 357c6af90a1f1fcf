#![forbid(unsafe_code)]

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::types::{GraphError, Result};

/// Whole-file storage capability the engine persists through.
///
/// Paths are flat names relative to the store root (`MANIFEST`,
/// `sst-000004.sst`, ...). `write` replaces a file atomically; `append`
/// extends it in place.
pub trait FileStore: Send + Sync + 'static {
    /// Atomically replaces `path` with `bytes`.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<()>;
    /// Reads the full contents of `path`.
    fn read(&self, path: &str) -> Result<Vec<u8>>;
    /// Appends `bytes` to `path`, creating it if missing.
    fn append(&self, path: &str, bytes: &[u8]) -> Result<()>;
    /// Flushes `path` to stable storage.
    fn sync(&self, path: &str) -> Result<()>;
    /// Removes `path`; removing a missing file succeeds.
    fn remove(&self, path: &str) -> Result<()>;
    /// Returns true if `path` exists.
    fn exists(&self, path: &str) -> Result<bool>;
}

/// Maps a missing-file I/O error onto `NotFound`, leaving other errors intact.
pub fn missing_as_not_found(err: GraphError, path: &str) -> GraphError {
    match err {
        GraphError::Io(ref io_err) if io_err.kind() == io::ErrorKind::NotFound => {
            GraphError::NotFound(format!("file {path}"))
        }
        other => other,
    }
}

/// [`FileStore`] rooted at a directory on the local filesystem.
#[derive(Clone, Debug)]
pub struct DirStore {
    root: Arc<PathBuf>,
}

impl DirStore {
    /// Opens (creating if needed) the directory at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root: Arc::new(root),
        })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty() || path.contains(['/', '\\']) || path == "." || path == ".." {
            return Err(GraphError::invalid(format!("illegal store path {path:?}")));
        }
        Ok(self.root.join(path))
    }
}

impl FileStore for DirStore {
    fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let target = self.resolve(path)?;
        let tmp = self.root.join(format!("{path}.tmp"));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.resolve(path)?)?)
    }

    fn append(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.resolve(path)?)?;
        file.write_all(bytes)?;
        Ok(())
    }

    fn sync(&self, path: &str) -> Result<()> {
        match OpenOptions::new().append(true).open(self.resolve(path)?) {
            Ok(file) => Ok(file.sync_data()?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn remove(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.resolve(path)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path)?.exists())
    }
}

/// In-memory [`FileStore`]; clones share the same files.
///
/// Used by tests and by [`StorageEngine::open_in_memory`](crate::db::StorageEngine::open_in_memory).
#[derive(Clone, Default)]
pub struct MemStore {
    files: Arc<Mutex<FxHashMap<String, Vec<u8>>>>,
}

impl MemStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all files currently present, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Cuts `path` down to `len` bytes, simulating a torn write.
    pub fn truncate(&self, path: &str, len: usize) -> Result<()> {
        let mut files = self.files.lock();
        let file = files
            .get_mut(path)
            .ok_or_else(|| GraphError::NotFound(format!("file {path}")))?;
        file.truncate(len);
        Ok(())
    }

    /// Length of `path` in bytes.
    pub fn file_len(&self, path: &str) -> Option<usize> {
        self.files.lock().get(path).map(Vec::len)
    }
}

impl FileStore for MemStore {
    fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.files.lock().insert(path.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.files.lock().get(path).cloned().ok_or_else(|| {
            GraphError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{path} not in memory store"),
            ))
        })
    }

    fn append(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.files
            .lock()
            .entry(path.to_owned())
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }

    fn sync(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.files.lock().remove(path);
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.files.lock().contains_key(path))
    }
}
