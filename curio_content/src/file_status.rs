use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::SystemTime,
};

use serde::{Deserialize, Serialize};

use crate::AssetGuid;

/// Whether a file has been seen during the current scan pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Liveness {
    #[default]
    Unknown,
    Valid,
    Stale,
}

/// Everything the curator knows about one file on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStatus {
    pub path: PathBuf,
    pub timestamp: Option<SystemTime>,
    /// Hash of the file content. `0` means that the file has not been hashed yet.
    pub content_hash: u64,
    /// The asset that this file represents, if any.
    pub owner: Option<AssetGuid>,
    pub liveness: Liveness,
    /// The file could not be opened the last time it was hashed.
    pub locked: bool,
}

impl FileStatus {
    fn new(path: PathBuf, timestamp: Option<SystemTime>) -> Self {
        Self {
            path,
            timestamp,
            content_hash: 0,
            owner: None,
            liveness: Liveness::Unknown,
            locked: false,
        }
    }

    pub fn is_hashed(&self) -> bool {
        self.content_hash != 0
    }

    /// Forgets the hash so that the file is hashed again.
    pub fn invalidate(&mut self) {
        self.content_hash = 0;
    }
}

/// Table of all [`FileStatus`]es, keyed by their normalized path.
///
/// The store is not synchronized by itself. The curator only accesses it while holding
/// its state lock.
#[derive(Debug, Default)]
pub struct FileStatusStore {
    files: BTreeMap<PathBuf, FileStatus>,
}

impl FileStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or fetches the record for `path`. If the stored timestamp differs from
    /// `timestamp` the hash is reset so that the file gets hashed again.
    pub fn upsert(&mut self, path: impl Into<PathBuf>, timestamp: Option<SystemTime>) -> &mut FileStatus {
        let path = path.into();
        let file_status = self
            .files
            .entry(path.clone())
            .or_insert_with(|| FileStatus::new(path, timestamp));
        if file_status.timestamp != timestamp {
            file_status.timestamp = timestamp;
            file_status.invalidate();
        }
        file_status
    }

    /// Inserts a complete record, e.g. one that was loaded from the cache.
    pub fn insert(&mut self, file_status: FileStatus) {
        self.files.insert(file_status.path.clone(), file_status);
    }

    /// Sets the liveness of every record to [`Liveness::Unknown`]. Called at the start of a scan.
    pub fn mark_all_unknown(&mut self) {
        for file_status in self.files.values_mut() {
            file_status.liveness = Liveness::Unknown;
        }
    }

    /// Marks the file as seen during the current scan.
    pub fn mark_valid(&mut self, path: &Path) {
        if let Some(file_status) = self.files.get_mut(path) {
            file_status.liveness = Liveness::Valid;
        }
    }

    /// Removes all records that have not been seen since [`FileStatusStore::mark_all_unknown`]
    /// and returns them so that the assets they owned can be reconciled.
    pub fn purge_stale(&mut self) -> Vec<FileStatus> {
        for file_status in self.files.values_mut() {
            if file_status.liveness == Liveness::Unknown {
                file_status.liveness = Liveness::Stale;
            }
        }
        let stale_paths = self
            .files
            .values()
            .filter(|file_status| file_status.liveness == Liveness::Stale)
            .map(|file_status| file_status.path.clone())
            .collect::<Vec<_>>();
        stale_paths.iter().filter_map(|path| self.files.remove(path)).collect()
    }

    /// Paths of all files that still have to be hashed.
    pub fn unhashed(&self) -> Vec<PathBuf> {
        self.files
            .values()
            .filter(|file_status| !file_status.is_hashed())
            .map(|file_status| file_status.path.clone())
            .collect()
    }

    pub fn get(&self, path: &Path) -> Option<&FileStatus> {
        self.files.get(path)
    }

    pub fn get_mut(&mut self, path: &Path) -> Option<&mut FileStatus> {
        self.files.get_mut(path)
    }

    pub fn remove(&mut self, path: &Path) -> Option<FileStatus> {
        self.files.remove(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileStatus> {
        self.files.values()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }
}
