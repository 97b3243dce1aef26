//! Storage trait and implementations

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::{Result, StoreError};

/// Backing medium for exactly one serialized document.
pub trait Storage: Send + Sync {
    fn read(&self) -> Result<Option<Vec<u8>>>;
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
    fn remove(&mut self) -> Result<()>;
}

impl Storage for Box<dyn Storage> {
    fn read(&self) -> Result<Option<Vec<u8>>> {
        (**self).read()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).write(bytes)
    }

    fn remove(&mut self) -> Result<()> {
        (**self).remove()
    }
}

/// In-memory storage (for testing and demos)
///
/// Clones share the same buffer, so a test can keep a handle and inspect
/// what the document persisted.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    data: Arc<RwLock<Option<Vec<u8>>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the buffer, e.g. with a corrupt payload.
    pub fn with_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Arc::new(RwLock::new(Some(bytes.into()))),
        }
    }

    pub fn bytes(&self) -> Option<Vec<u8>> {
        self.data.read().map(|d| d.clone()).unwrap_or(None)
    }
}

impl Storage for InMemoryStorage {
    fn read(&self) -> Result<Option<Vec<u8>>> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(data.clone())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        *data = Some(bytes.to_vec());
        Ok(())
    }

    fn remove(&mut self) -> Result<()> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        *data = None;
        Ok(())
    }
}

/// One JSON file on disk.
///
/// Writes go to `<file>.tmp` first and are renamed over the target, so a
/// crash mid-write leaves the previous version readable.
#[derive(Clone, Debug)]
pub struct FileBackedStorage {
    path: PathBuf,
}

impl FileBackedStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Storage for FileBackedStorage {
    fn read(&self) -> Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Storage(format!("{}: {e}", self.path.display()))),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Storage(format!("{}: {e}", parent.display())))?;
            }
        }
        let tmp = self.tmp_path();
        std::fs::write(&tmp, bytes)
            .map_err(|e| StoreError::Storage(format!("{}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| StoreError::Storage(format!("{}: {e}", self.path.display())))?;
        Ok(())
    }

    fn remove(&mut self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Storage(format!("{}: {e}", self.path.display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_storage_missing_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileBackedStorage::new(dir.path().join("absent.json"));
        assert!(storage.read().unwrap().is_none());
    }

    #[test]
    fn test_file_storage_creates_parent_and_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/volumes/doc.json");
        let mut storage = FileBackedStorage::new(&path);

        storage.write(b"{\"a\":1}").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"{\"a\":1}");
        assert!(!dir.path().join("nested/volumes/doc.json.tmp").exists());
    }

    #[test]
    fn test_in_memory_clones_share_buffer() {
        let mut a = InMemoryStorage::new();
        let b = a.clone();
        a.write(b"x").unwrap();
        assert_eq!(b.bytes(), Some(b"x".to_vec()));
        a.remove().unwrap();
        assert!(b.bytes().is_none());
    }
}
