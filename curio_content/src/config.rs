use std::{
    fs,
    path::{Path, PathBuf},
};

use curio_shared::log::info;
use serde::{Deserialize, Serialize};

use crate::{profile::PlatformProfile, Error, Result};

/// A document type that is copied to the output unchanged. Only used by the command line tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassthroughType {
    pub name: String,
    pub extensions: Vec<String>,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

/// Configuration of a [`Curator`](crate::Curator) session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CuratorConfig {
    /// Directories that are scanned for assets.
    pub data_directories: Vec<PathBuf>,
    /// Root of the transformed outputs, thumbnails and the cache.
    pub output_directory: PathBuf,
    pub profiles: Vec<PlatformProfile>,
    /// Name of the profile that is active after startup. The first profile when not set.
    pub active_profile: Option<String>,
    /// Whether the file and asset tables are stored between sessions.
    pub persist_cache: bool,
    /// Optional `logical;physical` table that redirects paths found while scanning.
    /// Logical paths are relative to the first data directory.
    pub redirection_file: Option<PathBuf>,
    pub passthrough_types: Vec<PassthroughType>,
}

impl Default for CuratorConfig {
    fn default() -> Self {
        Self {
            data_directories: vec![PathBuf::from("data")],
            output_directory: PathBuf::from("output"),
            profiles: vec![PlatformProfile::new("PC")],
            active_profile: None,
            persist_cache: false,
            redirection_file: None,
            passthrough_types: Vec::new(),
        }
    }
}

impl CuratorConfig {
    /// Reads the configuration from a YAML file. Relative directories are resolved
    /// against the directory containing the file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Reading curator configuration from '{}'", path.display());
        let text = fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|err| Error::InvalidConfig(err.to_string()))
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        self.data_directories.iter_mut().for_each(resolve);
        resolve(&mut self.output_directory);
        if let Some(redirection_file) = &mut self.redirection_file {
            resolve(redirection_file);
        }
    }

    /// Checks that the data directories exist and that at least one profile is configured.
    pub fn validate(&self) -> Result<()> {
        if self.data_directories.is_empty() {
            return Err(Error::InvalidConfig("no data directory configured".to_owned()));
        }
        for directory in &self.data_directories {
            if !directory.is_dir() {
                return Err(Error::InvalidConfig(format!(
                    "data directory '{}' doesn't exist",
                    directory.display()
                )));
            }
        }
        if self.profiles.is_empty() {
            return Err(Error::InvalidConfig("at least one platform profile is required".to_owned()));
        }
        Ok(())
    }
}
