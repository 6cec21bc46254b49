use std::{collections::BTreeMap, fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{transformer::LogEntry, AssetGuid};

/// Whether the derived output of an asset is current for a platform profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub enum TransformState {
    /// The asset has not been hashed yet.
    #[default]
    Unknown,
    UpToDate,
    /// Only the thumbnail has to be regenerated.
    NeedsThumbnail,
    NeedsTransform,
    /// A transform dependency is unknown or not hashed.
    MissingDependency,
    /// A runtime reference is unknown or not hashed.
    MissingReference,
    /// No transformer is registered for the document type of the asset.
    TransformError,
}

impl TransformState {
    /// Whether a transform request can do anything about this state.
    pub fn is_transformable(&self) -> bool {
        matches!(self, TransformState::NeedsThumbnail | TransformState::NeedsTransform)
    }
}

impl fmt::Display for TransformState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransformState::Unknown => "Unknown",
            TransformState::UpToDate => "UpToDate",
            TransformState::NeedsThumbnail => "NeedsThumbnail",
            TransformState::NeedsTransform => "NeedsTransform",
            TransformState::MissingDependency => "MissingDependency",
            TransformState::MissingReference => "MissingReference",
            TransformState::TransformError => "TransformError",
        };
        f.pad(name)
    }
}

/// Lifecycle of an [`AssetInfo`] between two scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExistenceState {
    Added,
    Modified,
    /// The file is gone. The asset is removed by the next scan.
    ToBeDeleted,
}

/// The hash and transform version recorded in the header of an output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub hash: u64,
    pub version: u32,
}

/// State of an asset for one platform profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileStatus {
    pub state: TransformState,
    /// Combination of the transitive dependency hash and the profile. `0` when unknown.
    pub asset_hash: u64,
    /// Hash that the thumbnail has to be stamped with. `0` when unknown.
    pub thumb_hash: u64,
    pub existing_output: Option<OutputRecord>,
}

/// Everything the curator knows about one asset.
#[derive(Debug, Clone)]
pub struct AssetInfo {
    pub guid: AssetGuid,
    pub path: PathBuf,
    pub document_type: String,
    pub dependencies: Vec<AssetGuid>,
    pub references: Vec<AssetGuid>,
    pub profiles: BTreeMap<String, ProfileStatus>,
    pub existing_thumbnail: Option<OutputRecord>,
    pub existence: ExistenceState,
    /// Incremented on every change of the metadata or the content.
    pub generation: u64,
    /// Log of the last transform.
    pub log_entries: Vec<LogEntry>,
    pub last_error: Option<String>,
}

impl AssetInfo {
    pub fn new(guid: AssetGuid, path: impl Into<PathBuf>, document_type: impl Into<String>) -> Self {
        Self {
            guid,
            path: path.into(),
            document_type: document_type.into(),
            dependencies: Vec::new(),
            references: Vec::new(),
            profiles: BTreeMap::new(),
            existing_thumbnail: None,
            existence: ExistenceState::Added,
            generation: 0,
            log_entries: Vec::new(),
            last_error: None,
        }
    }

    /// State for the profile. Profiles that have never been evaluated are [`TransformState::Unknown`].
    pub fn state(&self, profile: &str) -> TransformState {
        self.profiles.get(profile).map(|status| status.state).unwrap_or_default()
    }

    pub fn profile_status_mut(&mut self, profile: &str) -> &mut ProfileStatus {
        self.profiles.entry(profile.to_owned()).or_default()
    }

    /// Marks the asset as modified. Cached evaluations are kept until the next evaluation.
    pub fn bump_generation(&mut self) {
        self.generation += 1;
        if self.existence != ExistenceState::Added {
            self.existence = ExistenceState::Modified;
        }
    }
}
