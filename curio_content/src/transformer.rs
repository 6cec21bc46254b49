use std::{
    collections::{BTreeMap, HashSet},
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use curio_shared::{
    bitflags::bitflags,
    log::{self, info, log},
};
use serde::{Deserialize, Serialize};

use crate::{profile::PlatformProfile, AssetGuid, Error, Result};

bitflags! {
    /// Capabilities of a document type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AssetTypeFlags: u32 {
        /// The transformer can generate a thumbnail.
        const SUPPORTS_THUMBNAIL = 0x00000001;
        /// A stale thumbnail makes the whole asset stale so that both are generated together.
        const AUTO_THUMBNAIL_ON_TRANSFORM = 0x00000002;
        /// Assets of this type are never transformed.
        const DISABLE_TRANSFORM = 0x00000004;
        /// Assets of this type are only transformed on explicit request.
        const ONLY_TRANSFORM_MANUALLY = 0x00000008;
    }
}

bitflags! {
    /// Options of a transform request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TransformFlags: u32 {
        /// Transform even if the output is up to date.
        const FORCE_TRANSFORM = 0x00000001;
        /// The request was issued by a user and not by an automatic process.
        const TRIGGERED_MANUALLY = 0x00000002;
    }
}

/// Severity of a [`LogEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl From<LogLevel> for log::Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Info => log::Level::Info,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

/// A message that a transformer produced for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.level, self.message)
    }
}

/// A document type together with its transform settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentType {
    /// The type tag in the asset header.
    pub name: String,
    /// Lowercase file extensions without the leading dot.
    pub extensions: Vec<String>,
    /// Stamped into every output. Bumping it invalidates all outputs of the type.
    pub version: u32,
    pub flags: AssetTypeFlags,
}

impl DocumentType {
    pub fn new(name: impl Into<String>, extensions: &[&str], version: u32) -> Self {
        Self {
            name: name.into(),
            extensions: extensions.iter().map(|extension| extension.to_lowercase()).collect(),
            version,
            flags: AssetTypeFlags::empty(),
        }
    }

    pub fn with_flags(mut self, flags: AssetTypeFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Everything a [`Transformer`] gets to know about the asset it transforms.
pub struct TransformContext {
    guid: AssetGuid,
    asset_path: PathBuf,
    document_type: DocumentType,
    profile: PlatformProfile,
    dependency_outputs: BTreeMap<AssetGuid, PathBuf>,
    log_entries: Vec<LogEntry>,
}

impl TransformContext {
    pub fn new(
        guid: AssetGuid,
        asset_path: impl Into<PathBuf>,
        document_type: DocumentType,
        profile: PlatformProfile,
        dependency_outputs: BTreeMap<AssetGuid, PathBuf>,
    ) -> Self {
        Self {
            guid,
            asset_path: asset_path.into(),
            document_type,
            profile,
            dependency_outputs,
            log_entries: Vec::new(),
        }
    }

    pub fn guid(&self) -> &AssetGuid {
        &self.guid
    }

    pub fn asset_path(&self) -> &Path {
        &self.asset_path
    }

    pub fn document_type(&self) -> &DocumentType {
        &self.document_type
    }

    pub fn profile(&self) -> &PlatformProfile {
        &self.profile
    }

    /// Output files of the transform dependencies for the same profile.
    pub fn dependency_outputs(&self) -> &BTreeMap<AssetGuid, PathBuf> {
        &self.dependency_outputs
    }

    /// Reads the whole asset file.
    pub fn read_source(&self) -> std::result::Result<Vec<u8>, String> {
        fs::read(&self.asset_path).map_err(|err| format!("Failed to read '{}': {err}", self.asset_path.display()))
    }

    /// Reads the asset file without its header.
    pub fn read_body(&self) -> std::result::Result<Vec<u8>, String> {
        let source = self.read_source()?;
        Ok(strip_front_matter(&source).to_vec())
    }

    /// Adds an entry to the log of the asset and forwards it to the logger.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::new(level, message);
        log!(log::Level::from(level), "{}: {}", self.asset_path.display(), entry.message);
        self.log_entries.push(entry);
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn log_entries(&self) -> &[LogEntry] {
        &self.log_entries
    }

    pub fn into_log_entries(self) -> Vec<LogEntry> {
        self.log_entries
    }
}

/// Returns the part of an asset document after the front matter. Documents without
/// front matter are returned unchanged.
pub fn strip_front_matter(source: &[u8]) -> &[u8] {
    let is_delimiter = |line: &[u8]| {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        line == b"---"
    };

    let mut lines = source.split_inclusive(|byte| *byte == b'\n');
    let Some(first) = lines.next() else {
        return source;
    };
    if !is_delimiter(first) {
        return source;
    }
    let mut offset = first.len();
    for line in lines {
        offset += line.len();
        if is_delimiter(line) {
            return &source[offset..];
        }
    }
    source
}

/// Converts an asset into its platform-specific form.
///
/// Both methods are called outside of the curator lock and may take a long time.
/// Errors are reported as a message that ends up in the log of the asset.
pub trait Transformer: Send + Sync {
    fn transform(&self, context: &mut TransformContext) -> std::result::Result<Vec<u8>, String>;

    /// Only called for document types with [`AssetTypeFlags::SUPPORTS_THUMBNAIL`].
    fn generate_thumbnail(&self, context: &mut TransformContext) -> std::result::Result<Vec<u8>, String> {
        Err(format!(
            "Document type '{}' can't generate thumbnails",
            context.document_type().name
        ))
    }
}

/// Copies the body of the asset to the output.
#[derive(Debug, Default)]
pub struct PassthroughTransformer;

impl Transformer for PassthroughTransformer {
    fn transform(&self, context: &mut TransformContext) -> std::result::Result<Vec<u8>, String> {
        let body = context.read_body()?;
        context.info(format!("Copied {} bytes", body.len()));
        Ok(body)
    }
}

#[derive(Clone)]
pub struct RegisteredType {
    pub document_type: DocumentType,
    pub transformer: Arc<dyn Transformer>,
}

/// Maps document type tags and file extensions to [`Transformer`]s.
#[derive(Default, Clone)]
pub struct TransformerRegistry {
    types: BTreeMap<String, RegisteredType>,
    extensions: BTreeMap<String, String>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a document type. A type tag or an extension can only be registered once.
    pub fn register(&mut self, document_type: DocumentType, transformer: Arc<dyn Transformer>) -> Result<()> {
        if self.types.contains_key(&document_type.name) {
            return Err(Error::DocumentTypeAlreadyRegistered(document_type.name));
        }
        for (index, extension) in document_type.extensions.iter().enumerate() {
            if self.extensions.contains_key(extension) || document_type.extensions[..index].contains(extension) {
                return Err(Error::ExtensionAlreadyRegistered(extension.clone()));
            }
        }

        info!(
            "Registering document type '{}' (version {}) for extensions [{}]",
            document_type.name,
            document_type.version,
            document_type.extensions.join(", ")
        );
        for extension in &document_type.extensions {
            self.extensions.insert(extension.clone(), document_type.name.clone());
        }
        self.types.insert(
            document_type.name.clone(),
            RegisteredType {
                document_type,
                transformer,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredType> {
        self.types.get(name)
    }

    /// Like [`TransformerRegistry::get`] but fails with [`Error::DocumentTypeNotRegistered`].
    pub fn resolve(&self, name: &str) -> Result<&RegisteredType> {
        self.get(name)
            .ok_or_else(|| Error::DocumentTypeNotRegistered(name.to_owned()))
    }

    pub fn type_for_extension(&self, extension: &str) -> Option<&RegisteredType> {
        self.extensions
            .get(&extension.to_lowercase())
            .and_then(|name| self.types.get(name))
    }

    /// All registered extensions. These are the files the scanner looks at.
    pub fn extensions(&self) -> HashSet<String> {
        self.extensions.keys().cloned().collect()
    }

    pub fn document_types(&self) -> impl Iterator<Item = &DocumentType> {
        self.types.values().map(|registered| &registered.document_type)
    }
}

#[cfg(test)]
mod tests {
    use curio_test::{asset_document, setup_logger, write_file};
    use tempdir::TempDir;

    use super::*;

    struct Failing;

    impl Transformer for Failing {
        fn transform(&self, context: &mut TransformContext) -> std::result::Result<Vec<u8>, String> {
            context.error("broken");
            Err("broken".to_owned())
        }
    }

    fn context(path: &Path) -> TransformContext {
        TransformContext::new(
            AssetGuid::new_v4(),
            path,
            DocumentType::new("Text", &["txt"], 1),
            PlatformProfile::new("PC"),
            BTreeMap::new(),
        )
    }

    #[test]
    fn duplicate_registrations_are_rejected() {
        let mut registry = TransformerRegistry::new();
        registry
            .register(DocumentType::new("Texture", &["png", "TGA"], 1), Arc::new(PassthroughTransformer))
            .unwrap();

        let same_type = registry.register(DocumentType::new("Texture", &["dds"], 1), Arc::new(PassthroughTransformer));
        let same_extension = registry.register(DocumentType::new("Image", &["tga"], 1), Arc::new(PassthroughTransformer));

        assert!(matches!(same_type, Err(Error::DocumentTypeAlreadyRegistered(_))));
        assert!(matches!(same_extension, Err(Error::ExtensionAlreadyRegistered(_))));
        assert_eq!(registry.extensions().len(), 2);
        assert_eq!(registry.type_for_extension("PNG").unwrap().document_type.name, "Texture");
        assert!(matches!(registry.resolve("Image"), Err(Error::DocumentTypeNotRegistered(_))));
    }

    #[test]
    fn strip_front_matter_returns_body() {
        let document = asset_document("67e55044-10b1-426f-9247-bb680e5fe0c8", "Text", &[], &[], "body");
        assert_eq!(strip_front_matter(document.as_bytes()), b"body\n");
        assert_eq!(strip_front_matter(b"no header"), b"no header");
        assert_eq!(strip_front_matter(b"---\nunterminated"), b"---\nunterminated");
    }

    #[test]
    fn passthrough_copies_body() {
        setup_logger();
        let root = TempDir::new("root").unwrap();
        let path = write_file(root.path(), "a.txt", "---\nguid: x\ntype: Text\n---\nHello");
        let mut context = context(&path);

        let output = PassthroughTransformer.transform(&mut context).unwrap();

        assert_eq!(output, b"Hello");
        assert_eq!(context.log_entries().len(), 1);
        assert_eq!(context.log_entries()[0].level, LogLevel::Info);
    }

    #[test]
    fn failing_transformer_logs_and_default_thumbnail_is_unsupported() {
        setup_logger();
        let mut context = context(Path::new("/data/a.txt"));

        assert!(Failing.transform(&mut context).is_err());
        assert!(Failing.generate_thumbnail(&mut context).is_err());
        assert_eq!(context.into_log_entries(), vec![LogEntry::new(LogLevel::Error, "broken")]);
    }
}
