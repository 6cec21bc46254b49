use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use curio_shared::{
    chrono::{DateTime, Local},
    crossbeam_channel::Receiver,
    log::{error, info, trace, warn},
    parking_lot::{Mutex, RwLock},
};
use serde::{Deserialize, Serialize};

use crate::{
    asset_file::OutputLayout,
    asset_info::{AssetInfo, TransformState},
    cache::{load_cache, save_cache},
    common::normalize_path,
    config::CuratorConfig,
    evaluator::{Evaluation, TransformStateEvaluator},
    event::{CuratorEvent, EventBus},
    hash_worker::{HashOutcome, HashSink, HashWorker},
    lookup_table::{identity_resolver, LookupTable, PathResolver},
    orchestrator::{TransformOrchestrator, TransformReport, TransformStats, TransformStatus},
    profile::{PlatformProfile, ProfileSet},
    scanner::{DirectoryScanner, ScanStats},
    state::CuratorState,
    transformer::{DocumentType, LogEntry, LogLevel, TransformFlags, Transformer, TransformerRegistry},
    AssetGuid, Error, Result,
};

/// Request of an external transform worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTransformRequest {
    pub asset_guid: AssetGuid,
    pub platform: String,
    pub expected_asset_hash: u64,
    pub expected_thumb_hash: u64,
}

/// Answer to a [`RemoteTransformRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTransformResponse {
    pub success: bool,
    pub log_entries: Vec<LogEntry>,
}

impl RemoteTransformResponse {
    fn failure(mut log_entries: Vec<LogEntry>, err: &Error) -> Self {
        log_entries.push(LogEntry::new(LogLevel::Error, err.to_string()));
        Self {
            success: false,
            log_entries,
        }
    }
}

/// State that is shared between the caller threads and the hash worker.
pub(crate) struct Shared {
    pub(crate) state: Mutex<CuratorState>,
    pub(crate) registry: RwLock<TransformerRegistry>,
    pub(crate) profiles: RwLock<ProfileSet>,
    pub(crate) layout: OutputLayout,
    pub(crate) events: EventBus,
    pub(crate) in_flight: Mutex<HashSet<(AssetGuid, String)>>,
    pub(crate) cancel_requested: Arc<AtomicBool>,
    pub(crate) last_full_transform: Mutex<Option<DateTime<Local>>>,
}

impl Shared {
    /// Evaluates the asset and stores the result. The event has to be sent by the caller.
    pub(crate) fn evaluate_and_store(
        &self,
        state: &mut CuratorState,
        guid: &AssetGuid,
        profile: &PlatformProfile,
        force: bool,
    ) -> Result<(Evaluation, Option<CuratorEvent>)> {
        let evaluation = {
            let registry = self.registry.read();
            TransformStateEvaluator::new(state, &registry, &self.layout).evaluate(guid, profile, force)?
        };
        let event = state.store_evaluation(guid, &profile.name, &evaluation);
        Ok((evaluation, event))
    }

    /// Evaluates the assets and broadcasts the state changes. Assets that no longer exist are skipped.
    pub(crate) fn reevaluate(&self, guids: impl IntoIterator<Item = AssetGuid>, profile: &PlatformProfile) {
        let mut state = self.state.lock();
        let mut events = Vec::new();
        for guid in guids {
            match self.evaluate_and_store(&mut state, &guid, profile, false) {
                Ok((_, event)) => events.extend(event),
                Err(Error::UnknownAsset(_)) => {}
                Err(err) => warn!("Failed to evaluate asset {guid}: {err}"),
            }
        }
        // Sent under the lock so that no event can follow a concurrent reset
        self.events.send_all(events);
    }
}

/// Allows to cancel [`Curator::transform_all`] from another thread or from a transformer.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// [`Curator::transform_all`] stops before the next asset. If no run is in progress
    /// the next one is cancelled before it transforms anything.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Keeps track of all assets in the data directories and transforms them for the
/// platform profiles.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use curio_content::{Curator, CuratorConfig, DocumentType, PassthroughTransformer};
///
/// std::fs::create_dir_all("doc_data").unwrap();
/// let config = CuratorConfig {
///     data_directories: vec!["doc_data".into()],
///     output_directory: "doc_output".into(),
///     ..Default::default()
/// };
/// let curator = Curator::new(config)
///     .unwrap()
///     .register(DocumentType::new("Text", &["txt"], 1), Arc::new(PassthroughTransformer))
///     .unwrap();
/// curator.scan().unwrap();
/// ```
pub struct Curator {
    // Dropped first so that the worker thread is joined before the rest goes away
    worker: HashWorker,
    shared: Arc<Shared>,
    data_directories: Vec<PathBuf>,
    resolver: Arc<PathResolver>,
    persist_cache: bool,
}

impl Curator {
    /// Creates a new [`Curator`] and starts the hash worker. No files are scanned yet.
    pub fn new(config: CuratorConfig) -> Result<Self> {
        config.validate()?;
        info!("Creating Curator for {:?}", config.data_directories);

        let mut profiles = ProfileSet::new(config.profiles.clone())?;
        if let Some(active_profile) = &config.active_profile {
            let index = profiles
                .iter()
                .position(|profile| profile.name.eq_ignore_ascii_case(active_profile))
                .ok_or_else(|| Error::UnknownPlatformProfile(active_profile.clone()))?;
            profiles.set_active(index);
        }

        let data_directories = config.data_directories.iter().map(normalize_path).collect::<Vec<_>>();
        fs::create_dir_all(&config.output_directory)?;
        let layout = OutputLayout::new(normalize_path(&config.output_directory));

        let resolver = match &config.redirection_file {
            Some(redirection_file) => {
                let root = data_directories.first().cloned().unwrap_or_default();
                LookupTable::load(redirection_file)?.into_resolver(root)
            }
            None => identity_resolver(),
        };

        let mut state = CuratorState::default();
        if config.persist_cache {
            let cache_path = layout.cache_path();
            if cache_path.exists() {
                match load_cache(&cache_path) {
                    Ok(cached_state) => state = cached_state,
                    Err(err) => warn!("Ignoring the curator cache '{}': {err}", cache_path.display()),
                }
            }
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            registry: RwLock::new(TransformerRegistry::new()),
            profiles: RwLock::new(profiles),
            layout,
            events: EventBus::new(),
            in_flight: Mutex::new(HashSet::new()),
            cancel_requested: Arc::new(AtomicBool::new(false)),
            last_full_transform: Mutex::new(None),
        });

        let shared2 = shared.clone();
        let sink: Arc<HashSink> = Arc::new(move |outcome: HashOutcome| {
            let mut state = shared2.state.lock();
            let events = state.apply_hash_outcome(outcome);
            shared2.events.send_all(events);
        });
        let worker = HashWorker::new(sink)?;

        Ok(Self {
            worker,
            shared,
            data_directories,
            resolver,
            persist_cache: config.persist_cache,
        })
    }

    /// Registers a [`Transformer`] for a document type. The extensions of the type
    /// determine which files are considered during a scan.
    pub fn register(self, document_type: DocumentType, transformer: Arc<dyn Transformer>) -> Result<Self> {
        self.shared.registry.write().register(document_type, transformer)?;
        Ok(self)
    }

    /// Returns a channel that receives all [`CuratorEvent`]s.
    pub fn observe(&self) -> Receiver<CuratorEvent> {
        self.shared.events.observe()
    }

    /// Forgets all files and assets. No hash results are applied after this returns.
    pub fn reset(&self) {
        info!("Resetting the Curator");
        self.worker.clear_pending();
        self.worker.wait_idle();
        let mut state = self.shared.state.lock();
        // A concurrent scan may have queued files in the meantime. Results for them are
        // discarded because their files are no longer tracked.
        self.worker.clear_pending();
        state.clear();
        self.shared.events.send(CuratorEvent::AssetListReset);
    }

    /// Scans all data directories, removes the assets whose files are gone, hashes all
    /// new and modified files and evaluates all assets for the active profile.
    ///
    /// Returns after all files have been hashed.
    pub fn scan(&self) -> Result<ScanStats> {
        self.worker.wait_idle();
        let extensions = self.shared.registry.read().extensions();
        let scanner = DirectoryScanner::new(&extensions, self.resolver.as_ref());

        let (stats, unhashed) = {
            let mut state = self.shared.state.lock();
            state.files.mark_all_unknown();
            let mut stats = ScanStats::default();
            for directory in &self.data_directories {
                stats.accumulate(scanner.scan_directory(&mut state.files, directory));
            }
            let events = state.purge_stale_files();
            self.shared.events.send_all(events);
            (stats, state.files.unhashed())
        };

        info!("Hashing {} files", unhashed.len());
        self.worker.enqueue(unhashed);
        self.worker.wait_idle();

        let guids = self.shared.state.lock().assets.keys().copied().collect::<Vec<_>>();
        let profile = self.active_profile();
        self.shared.reevaluate(guids, &profile);

        if self.persist_cache {
            if let Err(err) = save_cache(&self.shared.state.lock(), &self.shared.layout.cache_path()) {
                error!("Failed to save the curator cache: {err}");
            }
        }
        Ok(stats)
    }

    /// Hashes one file again without a full scan and evaluates everything that is
    /// affected by it. A file that no longer exists marks its asset for deletion.
    pub fn notify_file_changed(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let extensions = self.shared.registry.read().extensions();
        if !DirectoryScanner::new(&extensions, self.resolver.as_ref()).is_valid_path(path) {
            trace!("Ignoring change of '{}' because its extension is not registered", path.display());
            return Ok(());
        }
        let path = normalize_path((self.resolver)(path));
        info!("File changed: {}", path.display());

        let (previous_owner, exists) = {
            let mut state = self.shared.state.lock();
            let previous_owner = state.files.get(&path).and_then(|file_status| file_status.owner);
            (previous_owner, state.mark_file_changed(&path))
        };
        if exists {
            self.worker.enqueue([path.clone()]);
            self.worker.wait_idle();
        }

        let affected = {
            let state = self.shared.state.lock();
            let current_owner = state.files.get(&path).and_then(|file_status| file_status.owner);
            let mut affected = BTreeSet::new();
            for owner in previous_owner.into_iter().chain(current_owner) {
                affected.insert(owner);
                affected.extend(state.graph.find_uses(&owner, true));
            }
            affected
        };
        let profile = self.active_profile();
        self.shared.reevaluate(affected, &profile);
        Ok(())
    }

    /// Marks the asset as modified and evaluates it and its users again.
    pub fn notify_asset_changed(&self, guid: &AssetGuid) -> Result<()> {
        let affected = {
            let mut state = self.shared.state.lock();
            let asset_info = state.assets.get_mut(guid).ok_or(Error::UnknownAsset(*guid))?;
            asset_info.bump_generation();
            let mut affected = state.graph.find_uses(guid, true);
            affected.insert(*guid);
            affected
        };
        let profile = self.active_profile();
        self.shared.reevaluate(affected, &profile);
        Ok(())
    }

    pub fn asset_info(&self, guid: &AssetGuid) -> Option<AssetInfo> {
        self.shared.state.lock().assets.get(guid).cloned()
    }

    /// GUIDs of all known assets.
    pub fn assets(&self) -> Vec<AssetGuid> {
        self.shared.state.lock().assets.keys().copied().collect()
    }

    /// Assets that depend on or reference `guid`.
    pub fn find_uses(&self, guid: &AssetGuid, transitive: bool) -> BTreeSet<AssetGuid> {
        self.shared.state.lock().graph.find_uses(guid, transitive)
    }

    /// Files that are ignored because they claim the GUID of another asset.
    pub fn collisions(&self) -> Vec<(PathBuf, AssetGuid)> {
        self.shared
            .state
            .lock()
            .collisions
            .iter()
            .map(|(path, guid)| (path.clone(), *guid))
            .collect()
    }

    /// Evaluates the asset for the profile and stores the resulting state.
    pub fn evaluate(&self, guid: &AssetGuid, profile: &str) -> Result<Evaluation> {
        let profile = self.resolve_profile(profile)?;
        self.evaluate_with_profile(guid, &profile, false)
    }

    fn evaluate_with_profile(&self, guid: &AssetGuid, profile: &PlatformProfile, force: bool) -> Result<Evaluation> {
        let mut state = self.shared.state.lock();
        let (evaluation, event) = self.shared.evaluate_and_store(&mut state, guid, profile, force)?;
        self.shared.events.send_all(event);
        Ok(evaluation)
    }

    /// Transforms the asset for the profile unless its output is up to date. The
    /// transform dependencies are transformed first.
    pub fn request_transform(&self, guid: &AssetGuid, profile: &str, flags: TransformFlags) -> Result<TransformStatus> {
        let profile = self.resolve_profile(profile)?;
        TransformOrchestrator::new(&self.shared).request_transform(guid, &profile, flags)
    }

    /// Transforms all assets for the profile, one after the other. Failures don't stop
    /// the run and are collected in the report.
    pub fn transform_all(&self, flags: TransformFlags, profile: &str) -> Result<TransformReport> {
        let profile = self.resolve_profile(profile)?;
        TransformOrchestrator::new(&self.shared).transform_all(&profile, flags)
    }

    /// Evaluates all assets for the profile and counts the states.
    pub fn transform_stats(&self, profile: &str) -> Result<TransformStats> {
        let profile = self.resolve_profile(profile)?;
        Ok(TransformOrchestrator::new(&self.shared).transform_stats(&profile))
    }

    /// Makes a running [`Curator::transform_all`] stop before the next asset. See
    /// [`CancelHandle::cancel`].
    pub fn request_cancel(&self) {
        self.cancel_handle().cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.shared.cancel_requested.clone())
    }

    /// Time at which the last [`Curator::transform_all`] completed without being cancelled.
    pub fn last_full_transform(&self) -> Option<DateTime<Local>> {
        *self.shared.last_full_transform.lock()
    }

    pub fn profiles(&self) -> Vec<PlatformProfile> {
        self.shared.profiles.read().iter().cloned().collect()
    }

    pub fn active_profile(&self) -> PlatformProfile {
        self.shared.profiles.read().active().clone()
    }

    /// Activates the profile at `index` (the first profile if out of range) and
    /// evaluates all assets for it.
    pub fn set_active_profile(&self, index: usize) -> PlatformProfile {
        let (previous, profile) = {
            let mut profiles = self.shared.profiles.write();
            let previous = profiles.active_index();
            profiles.set_active(index);
            (previous, profiles.active().clone())
        };
        if previous != self.shared.profiles.read().active_index() {
            info!("Active platform profile is now '{}'", profile.name);
            self.shared
                .events
                .send(CuratorEvent::ActiveProfileChanged(profile.name.clone()));
            let guids = self.assets();
            self.shared.reevaluate(guids, &profile);
        }
        profile
    }

    fn resolve_profile(&self, name: &str) -> Result<PlatformProfile> {
        self.shared.profiles.read().resolve(name).cloned()
    }

    pub fn data_directories(&self) -> &[PathBuf] {
        &self.data_directories
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.shared.layout
    }

    /// Handles the request of an external transform worker. When the hashes of the
    /// request don't match or the asset is stale, the file is hashed again before the
    /// asset is transformed.
    pub fn handle_remote_request(&self, request: &RemoteTransformRequest) -> RemoteTransformResponse {
        let guid = request.asset_guid;
        info!("Handling remote transform request for asset {guid} and platform '{}'", request.platform);

        let profile = match self.resolve_profile(&request.platform) {
            Ok(profile) => profile,
            Err(err) => return RemoteTransformResponse::failure(Vec::new(), &err),
        };
        let hashes_match = |evaluation: &Evaluation| {
            evaluation.asset_hash == request.expected_asset_hash && evaluation.thumb_hash == request.expected_thumb_hash
        };

        let mut evaluation = match self.evaluate_with_profile(&guid, &profile, false) {
            Ok(evaluation) => evaluation,
            Err(err) => return RemoteTransformResponse::failure(Vec::new(), &err),
        };
        if !hashes_match(&evaluation) || evaluation.state != TransformState::UpToDate {
            if let Some(asset_info) = self.asset_info(&guid) {
                if let Err(err) = self.notify_file_changed(&asset_info.path) {
                    return RemoteTransformResponse::failure(Vec::new(), &err);
                }
            }
            evaluation = match self.evaluate_with_profile(&guid, &profile, false) {
                Ok(evaluation) => evaluation,
                Err(err) => return RemoteTransformResponse::failure(Vec::new(), &err),
            };
        }

        let mut flags = TransformFlags::TRIGGERED_MANUALLY;
        if !hashes_match(&evaluation) {
            warn! {
                "Remote request for asset {guid} expects the hashes {:016x}/{:016x} but they are {:016x}/{:016x}",
                request.expected_asset_hash,
                request.expected_thumb_hash,
                evaluation.asset_hash,
                evaluation.thumb_hash
            }
            flags |= TransformFlags::FORCE_TRANSFORM;
        }

        let result = TransformOrchestrator::new(&self.shared).request_transform(&guid, &profile, flags);
        let log_entries = self
            .asset_info(&guid)
            .map(|asset_info| asset_info.log_entries)
            .unwrap_or_default();
        match result {
            Ok(status) => {
                trace!("Remote request for asset {guid} finished with {status:?}");
                RemoteTransformResponse {
                    success: true,
                    log_entries,
                }
            }
            // Transform failures are already part of the log of the asset
            Err(Error::TransformFailure { .. }) => RemoteTransformResponse {
                success: false,
                log_entries,
            },
            Err(err) => RemoteTransformResponse::failure(log_entries, &err),
        }
    }
}
