//! The file and asset tables are stored between sessions so that unchanged files
//! don't have to be hashed again.

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use curio_shared::log::info;
use serde::{Deserialize, Serialize};

use crate::{file_status::FileStatus, hasher::AssetHeader, state::CuratorState, Error, Result};

const CACHE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CachedAsset {
    path: PathBuf,
    header: AssetHeader,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    files: Vec<FileStatus>,
    assets: Vec<CachedAsset>,
}

/// Writes the file statuses and the asset headers to `path`. Files that collide with
/// another asset are stored unhashed so that the collision is reported again.
pub fn save_cache(state: &CuratorState, path: &Path) -> Result<()> {
    let files = state
        .files
        .iter()
        .map(|file_status| {
            let mut file_status = file_status.clone();
            if state.collisions.contains_key(&file_status.path) || file_status.locked {
                file_status.invalidate();
                file_status.owner = None;
            }
            file_status
        })
        .collect();
    let assets = state
        .assets
        .values()
        .map(|asset_info| CachedAsset {
            path: asset_info.path.clone(),
            header: AssetHeader {
                guid: asset_info.guid,
                document_type: asset_info.document_type.clone(),
                dependencies: asset_info.dependencies.clone(),
                references: asset_info.references.clone(),
            },
        })
        .collect();
    let cache_file = CacheFile {
        version: CACHE_VERSION,
        files,
        assets,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(writer, &cache_file).map_err(|err| Error::Cache(err.to_string()))?;
    info!(
        "Saved curator cache with {} files and {} assets to '{}'",
        cache_file.files.len(),
        cache_file.assets.len(),
        path.display()
    );
    Ok(())
}

/// Reads a cache that was written by [`save_cache`].
pub fn load_cache(path: &Path) -> Result<CuratorState> {
    let reader = BufReader::new(File::open(path)?);
    let cache_file: CacheFile = bincode::deserialize_from(reader).map_err(|err| Error::Cache(err.to_string()))?;
    if cache_file.version != CACHE_VERSION {
        return Err(Error::Cache(format!(
            "cache version {} doesn't match the expected version {CACHE_VERSION}",
            cache_file.version
        )));
    }

    let mut state = CuratorState::default();
    for file_status in cache_file.files {
        state.files.insert(file_status);
    }
    for cached_asset in cache_file.assets {
        // Only assets whose file is known and hashed are restored
        let restorable = state
            .files
            .get(&cached_asset.path)
            .map(|file_status| file_status.is_hashed() && file_status.owner == Some(cached_asset.header.guid))
            .unwrap_or(false);
        if restorable {
            state.restore_asset(&cached_asset.path, cached_asset.header);
        }
    }
    // Files whose asset could not be restored have to be hashed again
    let orphaned = state
        .files
        .iter()
        .filter(|file_status| file_status.owner.is_some_and(|owner| !state.assets.contains_key(&owner)))
        .map(|file_status| file_status.path.clone())
        .collect::<Vec<_>>();
    for path in orphaned {
        if let Some(file_status) = state.files.get_mut(&path) {
            file_status.invalidate();
            file_status.owner = None;
        }
    }

    info!(
        "Loaded curator cache with {} files and {} assets from '{}'",
        state.files.len(),
        state.assets.len(),
        path.display()
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;
    use crate::{hash_worker::HashOutcome, hasher::HashedFile, AssetGuid};

    #[test]
    fn save_and_load() {
        // Given
        let root = TempDir::new("root").unwrap();
        let mut state = CuratorState::default();
        let texture = AssetGuid::new_v4();
        let material = AssetGuid::new_v4();
        for (name, guid, dependencies) in [("tex", texture, vec![]), ("mat", material, vec![texture])] {
            let path = PathBuf::from(format!("/data/a.{name}"));
            state.files.upsert(&path, None);
            state.apply_hash_outcome(HashOutcome {
                path: path.clone(),
                result: Ok(HashedFile {
                    path,
                    hash: 3,
                    timestamp: None,
                    header: Some(AssetHeader {
                        guid,
                        document_type: name.to_owned(),
                        dependencies,
                        references: Vec::new(),
                    }),
                }),
            });
        }
        state.files.upsert("/data/plain.tex", None).content_hash = 9;

        // When
        let cache_path = root.path().join("out/curator.cache");
        save_cache(&state, &cache_path).unwrap();
        let loaded = load_cache(&cache_path).unwrap();

        // Then
        assert_eq!(loaded.files.len(), 3);
        assert_eq!(loaded.assets.len(), 2);
        assert_eq!(loaded.content_hash(&material), Some(3));
        assert_eq!(loaded.assets[&material].dependencies, vec![texture]);
        assert!(loaded.graph.find_uses(&texture, false).contains(&material));
        assert!(loaded.files.unhashed().is_empty());
    }

    #[test]
    fn garbage_is_a_cache_error() {
        let root = TempDir::new("root").unwrap();
        let cache_path = root.path().join("curator.cache");
        fs::write(&cache_path, b"\x02").unwrap();
        assert!(matches!(load_cache(&cache_path), Err(Error::Cache(_))));
    }

    #[test]
    fn missing_cache_is_an_io_error() {
        let root = TempDir::new("root").unwrap();
        assert!(matches!(load_cache(&root.path().join("missing")), Err(Error::IoError(_))));
    }
}
