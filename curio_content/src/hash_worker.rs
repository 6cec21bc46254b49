use std::{
    collections::HashSet,
    path::PathBuf,
    sync::Arc,
    thread::{self, JoinHandle},
};

use curio_shared::{
    log::{error, info, trace},
    parking_lot::{Condvar, Mutex},
    EventQueue,
};

use crate::{
    hasher::{hash_file, HashedFile},
    Error, Result,
};

/// Result of hashing one file on the worker thread.
#[derive(Debug)]
pub struct HashOutcome {
    pub path: PathBuf,
    pub result: Result<HashedFile>,
}

/// Receives every [`HashOutcome`]. Called on the worker thread without any worker lock held.
pub type HashSink = dyn Fn(HashOutcome) + Send + Sync;

#[derive(Default)]
struct QueueState {
    pending: EventQueue<PathBuf>,
    /// Same paths as `pending`
    pending_set: HashSet<PathBuf>,
    busy: bool,
    shutdown: bool,
}

impl QueueState {
    /// Queues the path unless it is already pending. A path that is currently being
    /// hashed can be queued again.
    fn push_unique(&mut self, path: PathBuf) -> bool {
        if !self.pending_set.insert(path.clone()) {
            return false;
        }
        self.pending.push(path);
        true
    }

    fn pop(&mut self) -> Option<PathBuf> {
        let path = self.pending.pop()?;
        self.pending_set.remove(&path);
        Some(path)
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.pending_set.clear();
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    work_available: Condvar,
    idle: Condvar,
}

/// Background thread that drains a FIFO of paths, hashes the files and hands the
/// results to a [`HashSink`].
pub struct HashWorker {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl HashWorker {
    /// Starts the worker thread.
    pub fn new(sink: Arc<HashSink>) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let shared2 = shared.clone();
        let thread_name = "HashWorker thread".to_owned();
        let thread = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run(&thread_name, &shared2, sink.as_ref()))
            .map_err(|_| Error::FailedToStartHashWorker)?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Queues the paths for hashing. Paths that are already pending are not queued twice.
    pub fn enqueue(&self, paths: impl IntoIterator<Item = PathBuf>) {
        let mut state = self.shared.state.lock();
        let mut queued = 0;
        for path in paths {
            if state.push_unique(path) {
                queued += 1;
            }
        }
        if queued > 0 {
            trace!("Queued {queued} files for hashing");
            self.shared.work_available.notify_one();
        }
    }

    /// Blocks until the queue is empty and no file is being hashed.
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        while (state.busy || !state.pending.is_empty()) && !state.shutdown {
            self.shared.idle.wait(&mut state);
        }
    }

    /// Drops all pending paths. A file that is currently being hashed is not affected.
    pub fn clear_pending(&self) {
        let mut state = self.shared.state.lock();
        let dropped = state.pending.len();
        state.clear();
        if dropped > 0 {
            trace!("Dropped {dropped} pending files from the hash queue");
        }
        if !state.busy {
            self.shared.idle.notify_all();
        }
    }

    /// Number of paths that are waiting to be hashed.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }
}

impl Drop for HashWorker {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.clear();
        }
        self.shared.work_available.notify_all();
        self.shared.idle.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("HashWorker thread panicked");
            }
        }
    }
}

/// Resets the busy flag even if the sink panics so that waiters are not blocked forever.
struct BusyGuard<'a> {
    shared: &'a Shared,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.busy = false;
        if state.pending.is_empty() {
            self.shared.idle.notify_all();
        }
    }
}

fn run(thread_name: &str, shared: &Shared, sink: &HashSink) {
    info!("Starting '{thread_name}'");
    loop {
        let path = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    info!("'{thread_name}' will stop now");
                    return;
                }
                if let Some(path) = state.pop() {
                    state.busy = true;
                    break path;
                }
                shared.idle.notify_all();
                shared.work_available.wait(&mut state);
            }
        };

        let _busy_guard = BusyGuard { shared };
        let result = hash_file(&path);
        sink(HashOutcome { path, result });
    }
}

#[cfg(test)]
mod tests {
    use curio_test::{setup_logger, write_file};
    use tempdir::TempDir;

    use std::time::{Duration, Instant};

    use super::*;
    use crate::hasher::stable_hash64;

    fn collecting_worker() -> (HashWorker, Arc<Mutex<Vec<HashOutcome>>>) {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let outcomes2 = outcomes.clone();
        let worker = HashWorker::new(Arc::new(move |outcome| outcomes2.lock().push(outcome))).unwrap();
        (worker, outcomes)
    }

    #[test]
    fn hashes_all_queued_files() {
        setup_logger();

        // Given
        let root = TempDir::new("root").unwrap();
        let a = write_file(root.path(), "a.tex", "a");
        let b = write_file(root.path(), "b.tex", "b");
        let (worker, outcomes) = collecting_worker();

        // When
        worker.enqueue(vec![a.clone(), b.clone()]);
        worker.wait_idle();

        // Then
        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].path, a);
        assert_eq!(outcomes[0].result.as_ref().unwrap().hash, stable_hash64(b"a"));
        assert_eq!(outcomes[1].path, b);
        assert_eq!(worker.pending(), 0);
    }

    #[test]
    fn unreadable_file_is_reported_as_locked() {
        setup_logger();
        let root = TempDir::new("root").unwrap();
        let (worker, outcomes) = collecting_worker();

        worker.enqueue(vec![root.path().join("missing.tex")]);
        worker.wait_idle();

        let outcomes = outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0].result, Err(Error::FileLocked(_))));
    }

    #[test]
    fn wait_idle_without_work_returns() {
        setup_logger();
        let (worker, outcomes) = collecting_worker();
        worker.wait_idle();
        worker.clear_pending();
        assert!(outcomes.lock().is_empty());
    }

    #[test]
    fn drop_joins_thread() {
        setup_logger();
        let root = TempDir::new("root").unwrap();
        let a = write_file(root.path(), "a.tex", "a");
        let (worker, _outcomes) = collecting_worker();
        worker.enqueue((0..100).map(|_| a.clone()));
        drop(worker);
    }

    #[test]
    fn pending_paths_are_coalesced() {
        // Given
        let mut state = QueueState::default();
        let a = PathBuf::from("/data/a.tex");
        let b = PathBuf::from("/data/b.tex");
        assert!(state.push_unique(a.clone()));
        assert!(state.push_unique(b.clone()));

        // When
        let queued_again = state.push_unique(a.clone());

        // Then
        assert!(!queued_again);
        assert_eq!(state.pending.iter().cloned().collect::<Vec<_>>(), vec![a.clone(), b.clone()]);

        // Once popped the path is being hashed and may be queued again
        assert_eq!(state.pop(), Some(a.clone()));
        assert!(state.push_unique(a.clone()));
        state.clear();
        assert!(state.pending.is_empty());
        assert!(state.push_unique(b));
    }

    #[test]
    fn coalescing_many_paths_is_fast() {
        // Given
        let mut state = QueueState::default();
        let paths = (0..50_000)
            .map(|i| PathBuf::from(format!("/project/data/textures/asset_{i}.tex")))
            .collect::<Vec<_>>();

        // When
        let start = Instant::now();
        for path in paths.iter().chain(paths.iter()) {
            state.push_unique(path.clone());
        }
        let elapsed = start.elapsed();

        // Then
        assert_eq!(state.pending.len(), paths.len());
        assert!(elapsed < Duration::from_secs(5), "coalescing took {elapsed:?}");
    }
}
