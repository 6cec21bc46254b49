use std::{
    env,
    fmt::{self, Formatter},
    io,
    path::{Component, Path, PathBuf},
    result,
    str::FromStr,
    time::SystemTime,
};

use curio_shared::{thiserror, uuid::Uuid};
use serde::{Deserialize, Serialize};

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid path: {0}")]
    InvalidPath(PathBuf),
    #[error("IoError: {0}")]
    IoError(#[from] io::Error),
    #[error("File is locked and could not be hashed: {0}")]
    FileLocked(PathBuf),
    #[error("Unknown platform profile: {0}")]
    UnknownPlatformProfile(String),
    #[error("Unknown asset: {0}")]
    UnknownAsset(AssetGuid),
    #[error("Asset {asset} has missing dependencies: {}", format_guids(.missing))]
    MissingDependency { asset: AssetGuid, missing: Vec<AssetGuid> },
    #[error("Asset {asset} has missing references: {}", format_guids(.missing))]
    MissingReference { asset: AssetGuid, missing: Vec<AssetGuid> },
    #[error("Asset {0} has not been hashed yet")]
    AssetNotHashed(AssetGuid),
    #[error("Failed to transform '{path}': {message}")]
    TransformFailure { path: PathBuf, message: String },
    #[error("Two files claim the asset GUID {guid}: kept '{kept}', rejected '{rejected}'")]
    GuidCollision { guid: AssetGuid, kept: PathBuf, rejected: PathBuf },
    #[error("Document type already registered: {0}")]
    DocumentTypeAlreadyRegistered(String),
    #[error("Document type not registered: {0}")]
    DocumentTypeNotRegistered(String),
    #[error("Extension already registered: {0}")]
    ExtensionAlreadyRegistered(String),
    #[error("Failed to start the hash worker")]
    FailedToStartHashWorker,
    #[error("Failed to start directory watcher in directory: {0}")]
    FailedToStartDirectoryWatcher(PathBuf),
    #[error("Failed to read the asset: {0}")]
    InvalidAssetData(PathBuf),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to read or write the curator cache: {0}")]
    Cache(String),
    #[error("Other: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

fn format_guids(guids: &[AssetGuid]) -> String {
    guids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Stable identifier of an asset. It is embedded in the header of the asset document
/// and therefore survives moving the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetGuid(Uuid);

impl AssetGuid {
    /// Creates a new random [`AssetGuid`].
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing [`Uuid`].
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for AssetGuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for AssetGuid {
    type Err = Error;

    /// Parses the hyphenated or simple form of a GUID.
    ///
    /// # Example
    ///
    /// ```rust
    /// use curio_content::AssetGuid;
    /// let guid: AssetGuid = "67e55044-10b1-426f-9247-bb680e5fe0c8".parse().unwrap();
    /// assert_eq!(guid.to_string(), "67e55044-10b1-426f-9247-bb680e5fe0c8");
    /// ```
    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|err| Error::Other(Box::new(err)))
    }
}

impl From<Uuid> for AssetGuid {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Returns the lowercase extension of the path.
pub(crate) fn extract_extension_from_path(path: &Path) -> Result<String> {
    Ok(path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| extension.to_lowercase())
        .ok_or(Error::InvalidPath(path.to_owned()))?
        .to_owned())
}

pub(crate) fn modified_system_time(path: &Path) -> Option<SystemTime> {
    path.metadata().ok().and_then(|metadata| metadata.modified().ok())
}

/// Turns the path into the form in which it is stored in the curator: absolute,
/// canonical when the file exists and lexically cleaned when it doesn't.
pub fn normalize_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }

    let absolute = if path.is_absolute() {
        path.to_owned()
    } else {
        env::current_dir().map(|cwd| cwd.join(path)).unwrap_or_else(|_| path.to_owned())
    };

    // The file might have been deleted, but its parent directory can often still be
    // canonicalized which keeps the result consistent with paths seen during a scan.
    if let (Some(parent), Some(file_name)) = (absolute.parent(), absolute.file_name()) {
        if let Ok(parent) = parent.canonicalize() {
            return parent.join(file_name);
        }
    }

    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempdir::TempDir;

    use super::*;

    #[test]
    fn guid_roundtrip_through_string() {
        let guid = AssetGuid::new_v4();
        let parsed: AssetGuid = guid.to_string().parse().unwrap();
        assert_eq!(parsed, guid);
    }

    #[test]
    fn invalid_guid() {
        assert!("not-a-guid".parse::<AssetGuid>().is_err());
    }

    #[test]
    fn extension_is_lowercase() {
        assert_eq!(extract_extension_from_path(Path::new("textures/Wall.PNG")).unwrap(), "png");
        assert!(extract_extension_from_path(Path::new("textures/README")).is_err());
    }

    #[test]
    fn normalize_existing_file() {
        let root = TempDir::new("root").unwrap();
        fs::create_dir_all(root.path().join("a")).unwrap();
        fs::write(root.path().join("a/file.txt"), "").unwrap();

        let normalized = normalize_path(root.path().join("a/../a/./file.txt"));

        assert_eq!(normalized, root.path().join("a/file.txt").canonicalize().unwrap());
    }

    #[test]
    fn normalize_deleted_file_keeps_canonical_parent() {
        let root = TempDir::new("root").unwrap();
        let normalized = normalize_path(root.path().join("deleted.txt"));
        assert_eq!(normalized, root.path().canonicalize().unwrap().join("deleted.txt"));
    }

    #[test]
    fn normalize_missing_directory_is_cleaned_lexically() {
        let normalized = normalize_path("/does/not/../exist/./file.txt");
        assert_eq!(normalized, PathBuf::from("/does/exist/file.txt"));
    }
}
