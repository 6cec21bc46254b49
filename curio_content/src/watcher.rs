use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use curio_shared::{
    log::{error, info, trace},
    pathdiff,
};
use notify_debouncer_full::{
    notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher},
    DebounceEventResult, DebouncedEvent, Debouncer, FileIdMap,
};

use crate::{Curator, Error, Result};

/// Forwards file system changes in the data directories to [`Curator::notify_file_changed`].
pub struct CuratorWatcher {
    running: Arc<AtomicBool>,
    _debouncer: Debouncer<RecommendedWatcher, FileIdMap>,
}

impl CuratorWatcher {
    pub fn new(curator: Arc<Curator>, directories: &[PathBuf], debounce: Duration) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));

        let running2 = running.clone();
        let directories2 = directories.to_vec();
        let watch_fn = move |result: DebounceEventResult| match result {
            Ok(events) => {
                for event in events {
                    let event_name = event_name(&event);
                    for path in &event.paths {
                        let display_path = relative_to_any(path, &directories2);
                        if !running2.load(Ordering::SeqCst) {
                            trace!("Watcher is inactive and reported '{event_name}' event for '{display_path}'");
                            continue;
                        }
                        match &event.kind {
                            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
                                info!("Watcher reported '{event_name}' event for '{display_path}'");
                                if let Err(err) = curator.notify_file_changed(path) {
                                    error!("Failed to handle the change of '{display_path}': {err}");
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
            Err(err) => {
                let errs = err.into_iter().map(|err| err.to_string()).collect::<Vec<_>>().join(", ");
                error!("Failed to receive events from file watcher: {errs}");
            }
        };

        let first_directory = directories.first().cloned().unwrap_or_default();
        let mut debouncer = notify_debouncer_full::new_debouncer(debounce, None, watch_fn)
            .map_err(|_| Error::FailedToStartDirectoryWatcher(first_directory))?;
        for directory in directories {
            debouncer
                .watcher()
                .watch(directory, RecursiveMode::Recursive)
                .map_err(|_| Error::FailedToStartDirectoryWatcher(directory.clone()))?;
            info!("Watching directory '{}'", directory.display());
        }

        Ok(Self {
            running,
            _debouncer: debouncer,
        })
    }

    /// Events that arrive while the watcher is inactive are dropped.
    pub fn set_active(&self, active: bool) {
        self.running.store(active, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn event_name(event: &DebouncedEvent) -> &str {
    match &event.kind {
        EventKind::Any => "Any",
        EventKind::Access(_) => "Access",
        EventKind::Create(_) => "Create",
        EventKind::Modify(_) => "Modify",
        EventKind::Remove(_) => "Remove",
        EventKind::Other => "Other",
    }
}

/// Path relative to the first directory that contains it. Only used for log messages.
fn relative_to_any(path: &Path, directories: &[PathBuf]) -> String {
    directories
        .iter()
        .filter(|directory| path.starts_with(directory))
        .find_map(|directory| pathdiff::diff_paths(path, directory))
        .unwrap_or_else(|| path.to_owned())
        .display()
        .to_string()
}
