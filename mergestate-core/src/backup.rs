//! Backup storage for pre-merge local file contents
//!
//! Backups are addressed by [`BackupKey`] (the hash of the destination path).
//! Resolving a conflict restores the backup into the working directory before
//! the merge tool runs, so a conflict can be re-resolved any number of times.

use bytes::Bytes;
use std::collections::HashMap;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use crate::error::{MergeStateError, Result};
use crate::node::BackupKey;

/// Storage for local-side file contents saved when a conflict is recorded
pub trait BackupStore {
    /// Save `data` under `key`, replacing any previous backup
    fn put(&mut self, key: &BackupKey, data: Bytes) -> Result<()>;

    /// Load the backup saved under `key`
    fn get(&self, key: &BackupKey) -> Result<Bytes>;

    /// Check if a backup exists
    fn contains(&self, key: &BackupKey) -> bool;

    /// Drop every backup
    fn clear(&mut self) -> Result<()>;
}

fn backup_error(key: &BackupKey, source: io::Error) -> MergeStateError {
    MergeStateError::Backup {
        key: key.to_string(),
        source,
    }
}

/// One file per backup key inside the merge state directory
#[derive(Debug, Clone)]
pub struct DiskBackupStore {
    dir: PathBuf,
}

impl DiskBackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn backup_path(&self, key: &BackupKey) -> PathBuf {
        self.dir.join(key.as_str())
    }
}

impl BackupStore for DiskBackupStore {
    fn put(&mut self, key: &BackupKey, data: Bytes) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| backup_error(key, e))?;
        fs::write(self.backup_path(key), &data).map_err(|e| backup_error(key, e))
    }

    fn get(&self, key: &BackupKey) -> Result<Bytes> {
        fs::read(self.backup_path(key))
            .map(Bytes::from)
            .map_err(|e| backup_error(key, e))
    }

    fn contains(&self, key: &BackupKey) -> bool {
        self.backup_path(key).is_file()
    }

    /// Removes the whole directory; a directory that was never created is fine.
    fn clear(&mut self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Backups held in memory for transient, non-resumable merges
#[derive(Debug, Clone, Default)]
pub struct MemoryBackupStore {
    backups: HashMap<BackupKey, Bytes>,
}

impl MemoryBackupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.backups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backups.is_empty()
    }
}

impl BackupStore for MemoryBackupStore {
    fn put(&mut self, key: &BackupKey, data: Bytes) -> Result<()> {
        self.backups.insert(key.clone(), data);
        Ok(())
    }

    fn get(&self, key: &BackupKey) -> Result<Bytes> {
        self.backups.get(key).cloned().ok_or_else(|| {
            backup_error(
                key,
                io::Error::new(ErrorKind::NotFound, "no in-memory backup"),
            )
        })
    }

    fn contains(&self, key: &BackupKey) -> bool {
        self.backups.contains_key(key)
    }

    fn clear(&mut self) -> Result<()> {
        self.backups.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_disk_put_and_get() {
        let temp = TempDir::new().unwrap();
        let mut store = DiskBackupStore::new(temp.path().join("merge"));
        let key = BackupKey::for_path("src/lib.rs");

        store.put(&key, Bytes::from_static(b"local content")).unwrap();
        assert!(store.contains(&key));
        assert!(temp.path().join("merge").join(key.as_str()).is_file());
        assert_eq!(store.get(&key).unwrap(), Bytes::from_static(b"local content"));
    }

    #[test]
    fn test_disk_missing_backup_is_backup_error() {
        let temp = TempDir::new().unwrap();
        let store = DiskBackupStore::new(temp.path().join("merge"));
        let key = BackupKey::for_path("missing");
        match store.get(&key) {
            Err(MergeStateError::Backup { key: k, source }) => {
                assert_eq!(k, key.to_string());
                assert_eq!(source.kind(), ErrorKind::NotFound);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_disk_clear_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let mut store = DiskBackupStore::new(temp.path().join("merge"));
        store.clear().unwrap();

        let key = BackupKey::for_path("a");
        store.put(&key, Bytes::from_static(b"a")).unwrap();
        store.clear().unwrap();
        assert!(!store.contains(&key));
        assert!(!store.dir().exists());
        store.clear().unwrap();
    }

    #[test]
    fn test_memory_store() {
        let mut store = MemoryBackupStore::new();
        let key = BackupKey::for_path("a");
        assert!(store.get(&key).is_err());

        store.put(&key, Bytes::from_static(b"one")).unwrap();
        store.put(&key, Bytes::from_static(b"two")).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&key).unwrap(), Bytes::from_static(b"two"));

        store.clear().unwrap();
        assert!(store.is_empty());
    }
}
