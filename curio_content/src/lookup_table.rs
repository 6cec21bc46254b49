//! Text tables with one `logical;physical` mapping per line.
//!
//! The same format is used in two directions: redirection files map the logical path
//! of a file to its physical location before the path reaches the curator, and the
//! asset tables that are written after a full transform map asset GUIDs to the files
//! containing their transformed output.

use std::{
    collections::BTreeMap,
    fs,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use curio_shared::log::{trace, warn};

/// Rewrites a path before it is stored in the curator.
pub type PathResolver = dyn Fn(&Path) -> PathBuf + Send + Sync;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupTable {
    entries: BTreeMap<String, String>,
}

impl LookupTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the table. Empty lines and lines starting with `//` or `#` are ignored,
    /// lines without a `;` are skipped with a warning.
    ///
    /// # Example
    ///
    /// ```rust
    /// use curio_content::LookupTable;
    /// let table = LookupTable::parse("textures/wall.png;/mnt/shared/wall.png\n");
    /// assert_eq!(table.get("textures/wall.png"), Some("/mnt/shared/wall.png"));
    /// ```
    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        for (line_index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("//") || line.starts_with('#') {
                continue;
            }
            let Some((logical, physical)) = line.split_once(';') else {
                warn!("Skipping line {} of lookup table without ';': {line}", line_index + 1);
                continue;
            };
            entries.insert(logical.trim().to_owned(), physical.trim().to_owned());
        }
        Self { entries }
    }

    /// Loads the table from a file.
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        trace!("Loaded lookup table '{}'", path.as_ref().display());
        Ok(Self::parse(&text))
    }

    /// Writes the table sorted by the logical name.
    pub fn write(&self, path: impl AsRef<Path>) -> io::Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(fs::File::create(path.as_ref())?);
        for (logical, physical) in &self.entries {
            writeln!(writer, "{logical};{physical}")?;
        }
        writer.flush()
    }

    pub fn insert(&mut self, logical: impl Into<String>, physical: impl Into<String>) {
        self.entries.insert(logical.into(), physical.into());
    }

    pub fn get(&self, logical: &str) -> Option<&str> {
        self.entries.get(logical).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(logical, physical)| (logical.as_str(), physical.as_str()))
    }

    /// Turns the table into a [`PathResolver`]. Logical names are matched relative to
    /// `root`, paths without an entry are returned unchanged.
    pub fn into_resolver(self, root: impl Into<PathBuf>) -> Arc<PathResolver> {
        let root = root.into();
        Arc::new(move |path: &Path| {
            let Ok(relative) = path.strip_prefix(&root) else {
                return path.to_owned();
            };
            let logical = relative.to_string_lossy().replace('\\', "/");
            match self.entries.get(&logical) {
                Some(physical) => {
                    let physical = Path::new(physical);
                    if physical.is_absolute() {
                        physical.to_owned()
                    } else {
                        root.join(physical)
                    }
                }
                None => path.to_owned(),
            }
        })
    }
}

/// The resolver that leaves all paths unchanged.
pub fn identity_resolver() -> Arc<PathResolver> {
    Arc::new(|path: &Path| path.to_owned())
}
