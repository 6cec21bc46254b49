use std::{
    collections::BTreeMap,
    mem,
    path::{Path, PathBuf},
};

use curio_shared::log::{error, info, trace, warn};

use crate::{
    asset_info::{AssetInfo, ExistenceState},
    dependency_graph::DependencyGraph,
    evaluator::Evaluation,
    event::CuratorEvent,
    file_status::FileStatusStore,
    hash_worker::HashOutcome,
    hasher::AssetHeader,
    AssetGuid,
};

/// Everything that is guarded by the curator lock. Files and assets are always
/// updated together.
#[derive(Debug, Default)]
pub struct CuratorState {
    pub files: FileStatusStore,
    pub assets: BTreeMap<AssetGuid, AssetInfo>,
    pub graph: DependencyGraph,
    /// Files that claim the GUID of another asset, keyed by their path.
    pub collisions: BTreeMap<PathBuf, AssetGuid>,
}

impl CuratorState {
    pub fn clear(&mut self) {
        self.files.clear();
        self.assets.clear();
        self.graph.clear();
        self.collisions.clear();
    }

    /// Content hash of the file of the asset. `None` for unknown assets.
    pub fn content_hash(&self, guid: &AssetGuid) -> Option<u64> {
        let asset_info = self.assets.get(guid)?;
        self.files.get(&asset_info.path).map(|file_status| file_status.content_hash)
    }

    /// Writes the result of hashing a file back and creates, updates, moves or
    /// removes the asset the file represents.
    pub fn apply_hash_outcome(&mut self, outcome: HashOutcome) -> Vec<CuratorEvent> {
        let HashOutcome { path, result } = outcome;
        let Some(file_status) = self.files.get_mut(&path) else {
            trace!("Discarding hash of '{}' because the file is no longer tracked", path.display());
            return Vec::new();
        };

        let hashed = match result {
            Ok(hashed) => hashed,
            Err(err) => {
                warn!("File '{}' will be hashed again during the next scan: {err}", path.display());
                file_status.invalidate();
                file_status.locked = true;
                return Vec::new();
            }
        };
        file_status.locked = false;
        file_status.content_hash = hashed.hash;
        if hashed.timestamp.is_some() {
            file_status.timestamp = hashed.timestamp;
        }
        let previous_owner = file_status.owner;
        let new_guid = hashed.header.as_ref().map(|header| header.guid);

        let mut events = Vec::new();

        // The file no longer represents the asset it used to represent
        if let Some(previous_owner) = previous_owner.filter(|owner| Some(*owner) != new_guid) {
            if let Some(file_status) = self.files.get_mut(&path) {
                file_status.owner = None;
            }
            let owned_by_file = self.assets.get(&previous_owner).map(|asset_info| asset_info.path == path);
            if owned_by_file == Some(true) {
                info!("File '{}' is no longer asset {previous_owner}", path.display());
                self.remove_asset(&previous_owner);
                events.push(CuratorEvent::AssetRemoved(previous_owner));
            }
        }
        if self.collisions.get(&path).copied() != new_guid {
            self.collisions.remove(&path);
        }

        if let Some(header) = hashed.header {
            self.apply_header(&path, header, &mut events);
        }
        events
    }

    /// Recreates an asset from a header that was stored in the cache.
    pub fn restore_asset(&mut self, path: &Path, header: AssetHeader) {
        let mut events = Vec::new();
        self.apply_header(path, header, &mut events);
    }

    fn apply_header(&mut self, path: &Path, header: AssetHeader, events: &mut Vec<CuratorEvent>) {
        let guid = header.guid;
        match self.assets.get_mut(&guid) {
            Some(asset_info) if asset_info.path == path => {
                trace!("Updating asset {guid} from '{}'", path.display());
                update_metadata(asset_info, &header);
                asset_info.bump_generation();
            }
            Some(asset_info) if asset_info.path.exists() => {
                let kept = asset_info.path.clone();
                error! {
                    "File '{}' claims GUID {guid} which already belongs to '{}'. The file is ignored.",
                    path.display(),
                    kept.display()
                }
                self.collisions.insert(path.to_owned(), guid);
                events.push(CuratorEvent::GuidCollision {
                    guid,
                    kept,
                    rejected: path.to_owned(),
                });
                return;
            }
            Some(asset_info) => {
                let from = mem::replace(&mut asset_info.path, path.to_owned());
                info!("Asset {guid} moved from '{}' to '{}'", from.display(), path.display());
                update_metadata(asset_info, &header);
                asset_info.bump_generation();
                if let Some(old_file_status) = self.files.get_mut(&from) {
                    old_file_status.owner = None;
                }
                events.push(CuratorEvent::AssetMoved {
                    guid,
                    from,
                    to: path.to_owned(),
                });
            }
            None => {
                info!("Found asset {guid} of type '{}' in '{}'", header.document_type, path.display());
                let mut asset_info = AssetInfo::new(guid, path, header.document_type.clone());
                update_metadata(&mut asset_info, &header);
                self.assets.insert(guid, asset_info);
                events.push(CuratorEvent::AssetAdded(guid));
            }
        }

        self.graph.set_dependencies(guid, header.dependencies.iter().copied());
        self.graph.set_references(guid, header.references.iter().copied());
        if let Some(file_status) = self.files.get_mut(path) {
            file_status.owner = Some(guid);
        }
    }

    /// Removes the asset and its outgoing edges. Files that collided with the asset are
    /// reset so that they are picked up again by the next hash pass.
    pub fn remove_asset(&mut self, guid: &AssetGuid) -> Option<AssetInfo> {
        let asset_info = self.assets.remove(guid)?;
        self.graph.remove_asset(*guid);

        let colliding = self
            .collisions
            .iter()
            .filter(|(_, colliding_guid)| *colliding_guid == guid)
            .map(|(path, _)| path.clone())
            .collect::<Vec<_>>();
        for path in colliding {
            trace!("Collision of '{}' with {guid} is resolved", path.display());
            self.collisions.remove(&path);
            if let Some(file_status) = self.files.get_mut(&path) {
                file_status.invalidate();
            }
        }
        Some(asset_info)
    }

    /// Removes the files that have not been seen during the scan together with their assets.
    pub fn purge_stale_files(&mut self) -> Vec<CuratorEvent> {
        let mut events = Vec::new();
        for file_status in self.files.purge_stale() {
            trace!("File '{}' no longer exists", file_status.path.display());
            self.collisions.remove(&file_status.path);
            let Some(owner) = file_status.owner else {
                continue;
            };
            let owned_by_file = self.assets.get(&owner).map(|asset_info| asset_info.path == file_status.path);
            if owned_by_file == Some(true) && self.remove_asset(&owner).is_some() {
                info!("Removed asset {owner} because '{}' is gone", file_status.path.display());
                events.push(CuratorEvent::AssetRemoved(owner));
            }
        }
        events
    }

    /// Forces a rehash of the file. Returns `false` when the file doesn't exist anymore.
    /// In that case its asset is marked as [`ExistenceState::ToBeDeleted`] and the next
    /// scan removes it.
    pub fn mark_file_changed(&mut self, path: &Path) -> bool {
        if path.is_file() {
            let timestamp = crate::common::modified_system_time(path);
            let file_status = self.files.upsert(path, timestamp);
            file_status.invalidate();
            self.files.mark_valid(path);
            return true;
        }

        let Some(file_status) = self.files.get_mut(path) else {
            return false;
        };
        file_status.invalidate();
        if let Some(asset_info) = file_status.owner.and_then(|owner| self.assets.get_mut(&owner)) {
            if asset_info.path == path {
                info!("Asset {} will be removed because '{}' is gone", asset_info.guid, path.display());
                asset_info.existence = ExistenceState::ToBeDeleted;
                asset_info.generation += 1;
            }
        }
        false
    }

    /// Stores the result of an evaluation. Returns an event when the state changed.
    pub fn store_evaluation(&mut self, guid: &AssetGuid, profile: &str, evaluation: &Evaluation) -> Option<CuratorEvent> {
        let asset_info = self.assets.get_mut(guid)?;
        if evaluation.thumbnail_checked {
            asset_info.existing_thumbnail = evaluation.existing_thumbnail;
        }
        let status = asset_info.profile_status_mut(profile);
        let old = status.state;
        status.state = evaluation.state;
        status.asset_hash = evaluation.asset_hash;
        status.thumb_hash = evaluation.thumb_hash;
        status.existing_output = evaluation.existing_output;

        (old != evaluation.state).then(|| CuratorEvent::AssetStateChanged {
            guid: *guid,
            profile: profile.to_owned(),
            old,
            new: evaluation.state,
        })
    }
}

fn update_metadata(asset_info: &mut AssetInfo, header: &AssetHeader) {
    asset_info.document_type = header.document_type.clone();
    asset_info.dependencies = header.dependencies.clone();
    asset_info.references = header.references.clone();
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use curio_shared::maplit::btreeset;
    use curio_test::{setup_logger, write_file};
    use tempdir::TempDir;

    use super::*;
    use crate::{
        asset_info::{OutputRecord, TransformState},
        hasher::HashedFile,
        Error,
    };

    fn outcome(path: &Path, hash: u64, header: Option<AssetHeader>) -> HashOutcome {
        HashOutcome {
            path: path.to_owned(),
            result: Ok(HashedFile {
                path: path.to_owned(),
                hash,
                timestamp: Some(SystemTime::UNIX_EPOCH),
                header,
            }),
        }
    }

    fn header(guid: AssetGuid, dependencies: &[AssetGuid]) -> AssetHeader {
        AssetHeader {
            guid,
            document_type: "Texture".to_owned(),
            dependencies: dependencies.to_vec(),
            references: Vec::new(),
        }
    }

    #[test]
    fn new_header_adds_asset() {
        setup_logger();

        // Given
        let mut state = CuratorState::default();
        let guid = AssetGuid::new_v4();
        let dependency = AssetGuid::new_v4();
        let path = PathBuf::from("/data/a.tex");
        state.files.upsert(&path, None);

        // When
        let events = state.apply_hash_outcome(outcome(&path, 5, Some(header(guid, &[dependency]))));

        // Then
        assert_eq!(events, vec![CuratorEvent::AssetAdded(guid)]);
        assert_eq!(state.content_hash(&guid), Some(5));
        assert_eq!(state.files.get(&path).unwrap().owner, Some(guid));
        assert_eq!(state.graph.find_uses(&dependency, false), btreeset! {guid});
    }

    #[test]
    fn untracked_file_is_discarded() {
        let mut state = CuratorState::default();
        let events = state.apply_hash_outcome(outcome(Path::new("/data/a.tex"), 5, Some(header(AssetGuid::new_v4(), &[]))));
        assert!(events.is_empty());
        assert!(state.assets.is_empty());
    }

    #[test]
    fn locked_file_stays_unhashed() {
        setup_logger();
        let mut state = CuratorState::default();
        let path = PathBuf::from("/data/a.tex");
        state.files.upsert(&path, None);

        state.apply_hash_outcome(HashOutcome {
            path: path.clone(),
            result: Err(Error::FileLocked(path.clone())),
        });

        let file_status = state.files.get(&path).unwrap();
        assert!(file_status.locked);
        assert_eq!(file_status.content_hash, 0);
    }

    #[test]
    fn second_file_with_same_guid_collides() {
        setup_logger();

        // Given
        let root = TempDir::new("root").unwrap();
        let first = write_file(root.path(), "first.tex", "");
        let second = write_file(root.path(), "second.tex", "");
        let mut state = CuratorState::default();
        state.files.upsert(&first, None);
        state.files.upsert(&second, None);
        let guid = AssetGuid::new_v4();
        state.apply_hash_outcome(outcome(&first, 1, Some(header(guid, &[]))));

        // When
        let events = state.apply_hash_outcome(outcome(&second, 2, Some(header(guid, &[]))));

        // Then
        assert_eq!(
            events,
            vec![CuratorEvent::GuidCollision {
                guid,
                kept: first.clone(),
                rejected: second.clone()
            }]
        );
        assert_eq!(state.assets[&guid].path, first);
        assert_eq!(state.files.get(&second).unwrap().owner, None);
        assert_eq!(state.collisions.get(&second), Some(&guid));

        // When the kept file is gone
        state.files.mark_all_unknown();
        state.files.mark_valid(&second);
        let events = state.purge_stale_files();

        // Then the colliding file is hashed again
        assert_eq!(events, vec![CuratorEvent::AssetRemoved(guid)]);
        assert!(state.collisions.is_empty());
        assert_eq!(state.files.unhashed(), vec![second]);
    }

    #[test]
    fn same_guid_at_new_location_is_a_move() {
        setup_logger();

        // Given
        let mut state = CuratorState::default();
        let old_path = PathBuf::from("/this/directory/does/not/exist/old.tex");
        let new_path = PathBuf::from("/this/directory/does/not/exist/new.tex");
        state.files.upsert(&old_path, None);
        state.files.upsert(&new_path, None);
        let guid = AssetGuid::new_v4();
        state.apply_hash_outcome(outcome(&old_path, 1, Some(header(guid, &[]))));

        // When
        let events = state.apply_hash_outcome(outcome(&new_path, 1, Some(header(guid, &[]))));

        // Then
        assert_eq!(
            events,
            vec![CuratorEvent::AssetMoved {
                guid,
                from: old_path.clone(),
                to: new_path.clone()
            }]
        );
        assert_eq!(state.assets[&guid].path, new_path);
        assert_eq!(state.files.get(&old_path).unwrap().owner, None);
    }

    #[test]
    fn losing_the_header_removes_the_asset() {
        setup_logger();
        let mut state = CuratorState::default();
        let path = PathBuf::from("/data/a.tex");
        state.files.upsert(&path, None);
        let guid = AssetGuid::new_v4();
        state.apply_hash_outcome(outcome(&path, 1, Some(header(guid, &[]))));

        let events = state.apply_hash_outcome(outcome(&path, 2, None));

        assert_eq!(events, vec![CuratorEvent::AssetRemoved(guid)]);
        assert!(state.assets.is_empty());
        assert_eq!(state.files.get(&path).unwrap().owner, None);
    }

    #[test]
    fn deleted_file_marks_asset_to_be_deleted() {
        setup_logger();
        let mut state = CuratorState::default();
        let path = PathBuf::from("/this/directory/does/not/exist/a.tex");
        state.files.upsert(&path, None);
        let guid = AssetGuid::new_v4();
        state.apply_hash_outcome(outcome(&path, 1, Some(header(guid, &[]))));

        assert!(!state.mark_file_changed(&path));

        assert_eq!(state.assets[&guid].existence, ExistenceState::ToBeDeleted);
        assert_eq!(state.content_hash(&guid), Some(0));
    }

    #[test]
    fn store_evaluation_reports_changes_only() {
        let mut state = CuratorState::default();
        let guid = AssetGuid::new_v4();
        state.assets.insert(guid, AssetInfo::new(guid, "/data/a.tex", "Texture"));
        let evaluation = Evaluation {
            state: TransformState::NeedsTransform,
            ..Default::default()
        };

        let first = state.store_evaluation(&guid, "PC", &evaluation);
        let second = state.store_evaluation(&guid, "PC", &evaluation);

        assert_eq!(
            first,
            Some(CuratorEvent::AssetStateChanged {
                guid,
                profile: "PC".to_owned(),
                old: TransformState::Unknown,
                new: TransformState::NeedsTransform
            })
        );
        assert_eq!(second, None);
        assert_eq!(state.assets[&guid].state("PC"), TransformState::NeedsTransform);
    }

    #[test]
    fn deleted_thumbnail_clears_the_record() {
        // Given
        let mut state = CuratorState::default();
        let guid = AssetGuid::new_v4();
        state.assets.insert(guid, AssetInfo::new(guid, "/data/a.mat", "Material"));
        let record = OutputRecord { hash: 7, version: 1 };
        let with_thumbnail = Evaluation {
            existing_thumbnail: Some(record),
            thumbnail_checked: true,
            ..Default::default()
        };
        state.store_evaluation(&guid, "PC", &with_thumbnail);
        assert_eq!(state.assets[&guid].existing_thumbnail, Some(record));

        // When
        let without_thumbnail = Evaluation {
            thumbnail_checked: true,
            ..Default::default()
        };
        state.store_evaluation(&guid, "PC", &without_thumbnail);

        // Then
        assert_eq!(state.assets[&guid].existing_thumbnail, None);
    }

    #[test]
    fn unchecked_thumbnail_keeps_the_record() {
        let mut state = CuratorState::default();
        let guid = AssetGuid::new_v4();
        state.assets.insert(guid, AssetInfo::new(guid, "/data/a.mat", "Material"));
        let record = OutputRecord { hash: 7, version: 1 };
        state.store_evaluation(
            &guid,
            "PC",
            &Evaluation {
                existing_thumbnail: Some(record),
                thumbnail_checked: true,
                ..Default::default()
            },
        );

        // A missing dependency stops the evaluation before the thumbnail is read
        state.store_evaluation(
            &guid,
            "PC",
            &Evaluation {
                state: TransformState::MissingDependency,
                ..Default::default()
            },
        );

        assert_eq!(state.assets[&guid].existing_thumbnail, Some(record));
    }
}
