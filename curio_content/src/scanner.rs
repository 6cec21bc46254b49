use std::{collections::HashSet, path::Path};

use curio_shared::{
    log::{info, trace, warn},
    walkdir::WalkDir,
};

use crate::{
    common::{extract_extension_from_path, modified_system_time, normalize_path},
    file_status::FileStatusStore,
    lookup_table::PathResolver,
};

/// Summary of a single [`DirectoryScanner::scan_directory`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    /// Files with a valid extension that have been marked as valid.
    pub visited: usize,
    /// Files that are new or whose timestamp changed and therefore have to be hashed.
    pub changed: usize,
    /// Directory entries that could not be read.
    pub skipped: usize,
}

impl ScanStats {
    pub fn accumulate(&mut self, other: ScanStats) {
        self.visited += other.visited;
        self.changed += other.changed;
        self.skipped += other.skipped;
    }
}

/// Walks data directories and records every file with a valid extension in the [`FileStatusStore`].
pub struct DirectoryScanner<'a> {
    valid_extensions: &'a HashSet<String>,
    resolver: &'a PathResolver,
}

impl<'a> DirectoryScanner<'a> {
    /// `valid_extensions` must be lowercase and without the leading dot.
    pub fn new(valid_extensions: &'a HashSet<String>, resolver: &'a PathResolver) -> Self {
        Self {
            valid_extensions,
            resolver,
        }
    }

    /// Whether the curator tracks files with the extension of `path`.
    pub fn is_valid_path(&self, path: &Path) -> bool {
        extract_extension_from_path(path)
            .map(|extension| self.valid_extensions.contains(&extension))
            .unwrap_or(false)
    }

    /// Recursively enumerates `root`. Every file with a valid extension is upserted and
    /// marked as valid. Entries that can't be read are skipped with a warning.
    pub fn scan_directory(&self, store: &mut FileStatusStore, root: &Path) -> ScanStats {
        info!("Scanning directory: {}", root.display());
        let mut stats = ScanStats::default();

        for entry in WalkDir::new(root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().map(|path| path.display().to_string()).unwrap_or_default();
                    warn!("Failed to read directory entry '{path}' while scanning '{}': {err}", root.display());
                    stats.skipped += 1;
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            // We are only interested in files with registered extensions.
            if !self.is_valid_path(entry.path()) {
                continue;
            }

            let path = normalize_path((self.resolver)(entry.path()));
            let timestamp = modified_system_time(&path);

            let file_status = store.upsert(&path, timestamp);
            if !file_status.is_hashed() {
                trace!("File needs to be hashed: {}", path.display());
                stats.changed += 1;
            }
            store.mark_valid(&path);
            stats.visited += 1;
        }

        info! {
            "Scanned directory '{}': {} files visited, {} changed, {} skipped",
            root.display(),
            stats.visited,
            stats.changed,
            stats.skipped
        }
        stats
    }
}
