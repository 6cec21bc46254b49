//! Content hashing and parsing of asset headers.
//!
//! An asset document starts with a YAML front-matter block:
//!
//! ```text
//! ---
//! guid: 67e55044-10b1-426f-9247-bb680e5fe0c8
//! type: Material
//! dependencies: [0b8a3c1e-52b2-4d0f-a3a4-3d1a6e2c9b11]
//! references: []
//! ---
//! <document body>
//! ```
//!
//! Files without such a block are plain files. They are hashed but don't become assets.

use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
    time::SystemTime,
};

use curio_shared::{
    blake3,
    log::{trace, warn},
};
use serde::{Deserialize, Serialize};

use crate::{common::modified_system_time, AssetGuid, Error, Result};

/// Only this many bytes at the start of a file are considered when looking for the header.
pub const HEADER_PREFIX_SIZE: usize = 64 * 1024;

const READ_CHUNK_SIZE: usize = 64 * 1024;
const FRONT_MATTER_DELIMITER: &str = "---";

/// The metadata block at the start of an asset document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetHeader {
    pub guid: AssetGuid,
    #[serde(rename = "type")]
    pub document_type: String,
    /// Assets whose content is consumed by the transform.
    #[serde(default)]
    pub dependencies: Vec<AssetGuid>,
    /// Assets that are only needed at runtime.
    #[serde(default)]
    pub references: Vec<AssetGuid>,
}

/// Result of [`hash_file`].
#[derive(Debug, Clone)]
pub struct HashedFile {
    pub path: PathBuf,
    pub hash: u64,
    pub timestamp: Option<SystemTime>,
    pub header: Option<AssetHeader>,
}

/// Incremental hasher whose result is stable across runs and platforms.
pub struct StableHasher {
    hasher: blake3::Hasher,
}

impl StableHasher {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update(bytes);
        self
    }

    pub fn update_u64(&mut self, value: u64) -> &mut Self {
        self.hasher.update(&value.to_le_bytes());
        self
    }

    /// Length-prefixed so that consecutive strings can't be confused with each other.
    pub fn update_str(&mut self, value: &str) -> &mut Self {
        self.update_u64(value.len() as u64);
        self.hasher.update(value.as_bytes());
        self
    }

    /// Returns the first 8 bytes of the digest. `0` is reserved for "not hashed" and
    /// is therefore never returned.
    pub fn finish(&self) -> u64 {
        let digest = self.hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.as_bytes()[..8]);
        match u64::from_le_bytes(bytes) {
            0 => 1,
            hash => hash,
        }
    }
}

impl Default for StableHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hashes `bytes` with a [`StableHasher`].
pub fn stable_hash64(bytes: &[u8]) -> u64 {
    StableHasher::new().update(bytes).finish()
}

/// Combines two hashes into one. The order of the arguments matters.
pub fn combine_hashes(first: u64, second: u64) -> u64 {
    StableHasher::new().update_u64(first).update_u64(second).finish()
}

/// Streams the file through the hasher and parses the asset header from its beginning.
///
/// Returns [`Error::FileLocked`] when the file can't be opened or read.
pub fn hash_file(path: &Path) -> Result<HashedFile> {
    trace!("Hashing file: {}", path.display());
    let timestamp = modified_system_time(path);
    let file = File::open(path).map_err(|err| {
        warn!("Failed to open '{}' for hashing: {err}", path.display());
        Error::FileLocked(path.to_owned())
    })?;
    let (hash, prefix) = hash_reader(file).map_err(|err| {
        warn!("Failed to read '{}' while hashing: {err}", path.display());
        Error::FileLocked(path.to_owned())
    })?;

    let header = match parse_header(&prefix) {
        Ok(header) => header,
        Err(message) => {
            warn!("Ignoring malformed asset header in '{}': {message}", path.display());
            None
        }
    };

    Ok(HashedFile {
        path: path.to_owned(),
        hash,
        timestamp,
        header,
    })
}

/// Returns the hash of everything in `reader` and the first [`HEADER_PREFIX_SIZE`] bytes.
fn hash_reader<R: Read>(mut reader: R) -> io::Result<(u64, Vec<u8>)> {
    let mut hasher = StableHasher::new();
    let mut prefix = Vec::new();
    let mut buffer = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        let chunk = &buffer[..read];
        hasher.update(chunk);
        if prefix.len() < HEADER_PREFIX_SIZE {
            let remaining = HEADER_PREFIX_SIZE - prefix.len();
            prefix.extend_from_slice(&chunk[..remaining.min(chunk.len())]);
        }
    }
    Ok((hasher.finish(), prefix))
}

/// Parses the front matter. `Ok(None)` means that the file doesn't start with a header
/// at all, `Err` that it starts with one that can't be used.
pub fn parse_header(prefix: &[u8]) -> std::result::Result<Option<AssetHeader>, String> {
    let decoded = String::from_utf8_lossy(prefix);
    let text: &str = &decoded;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut lines = text.split_inclusive('\n');
    match lines.next() {
        Some(first) if first.trim_end() == FRONT_MATTER_DELIMITER => {}
        _ => return Ok(None),
    }

    let mut yaml = String::new();
    let mut closed = false;
    for line in lines {
        if line.trim_end() == FRONT_MATTER_DELIMITER {
            closed = true;
            break;
        }
        yaml.push_str(line);
    }
    if !closed {
        return Err(format!(
            "the header is not terminated by '{FRONT_MATTER_DELIMITER}' within the first {HEADER_PREFIX_SIZE} bytes"
        ));
    }

    serde_yaml::from_str::<AssetHeader>(&yaml)
        .map(Some)
        .map_err(|err| err.to_string())
}
