//! Helpers for the tests of the curio crates.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Once,
    time::{Duration, SystemTime},
};

use curio_shared::{indoc::formatdoc, log::LevelFilter};
use filetime::FileTime;

static LOGGER: Once = Once::new();

/// Installs a logger for the test process. Can be called from every test.
pub fn setup_logger() {
    LOGGER.call_once(|| {
        let result = simple_logger::SimpleLogger::new()
            .with_level(LevelFilter::Trace)
            .with_module_level("notify", LevelFilter::Warn)
            .init();
        if let Err(err) = result {
            println!("Failed to install the logger: {err}");
        }
    });
}

/// Writes `content` to `root/relative_path` and creates the parent directories.
pub fn write_file(root: &Path, relative_path: impl AsRef<Path>, content: impl AsRef<[u8]>) -> PathBuf {
    let path = root.join(relative_path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("failed to create the parent directory");
    }
    fs::write(&path, content).unwrap_or_else(|err| panic!("failed to write '{}': {err}", path.display()));
    path
}

/// Creates the text of an asset document with a front-matter header.
pub fn asset_document(guid: &str, document_type: &str, dependencies: &[&str], references: &[&str], body: &str) -> String {
    let list = |guids: &[&str]| format!("[{}]", guids.join(", "));
    formatdoc! {"
        ---
        guid: {guid}
        type: {document_type}
        dependencies: {dependencies}
        references: {references}
        ---
        {body}
        ",
        guid = guid,
        document_type = document_type,
        dependencies = list(dependencies),
        references = list(references),
        body = body,
    }
}

/// Moves the modification time of the file into the future so that a change is
/// detected even on file systems with a coarse timestamp resolution.
pub fn touch(path: &Path) -> io::Result<()> {
    let current = fs::metadata(path)?.modified()?;
    let now = SystemTime::now().max(current);
    let bumped = now + Duration::from_secs(2);
    filetime::set_file_mtime(path, FileTime::from_system_time(bumped))
}
