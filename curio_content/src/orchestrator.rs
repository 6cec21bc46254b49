use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    path::PathBuf,
    sync::atomic::Ordering,
};

use curio_shared::{
    chrono::Local,
    log::{error, info, trace, warn},
    parking_lot::Mutex,
};

use crate::{
    asset_file::{read_output_record, write_output_file, OutputHeader, THUMBNAIL_FILE_TYPE},
    asset_info::TransformState,
    curator::Shared,
    dependency_graph::DependencyKind,
    evaluator::Evaluation,
    lookup_table::LookupTable,
    profile::PlatformProfile,
    transformer::{AssetTypeFlags, LogEntry, LogLevel, RegisteredType, TransformContext, TransformFlags},
    AssetGuid, Error, Result,
};

/// Outcome of a successful [`Curator::request_transform`](crate::Curator::request_transform).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformStatus {
    /// The output (and the thumbnail if it was stale) has been written.
    Transformed,
    /// Only the thumbnail has been written.
    ThumbnailGenerated,
    UpToDate,
    /// The document type is excluded from this kind of transform.
    Skipped,
    /// The same asset is already being transformed for the same profile.
    Busy,
}

/// An asset that failed during [`Curator::transform_all`](crate::Curator::transform_all).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTransform {
    pub guid: AssetGuid,
    pub message: String,
}

/// Summary of [`Curator::transform_all`](crate::Curator::transform_all).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformReport {
    pub profile: String,
    pub statuses: BTreeMap<AssetGuid, TransformStatus>,
    pub failures: Vec<FailedTransform>,
    /// The run was cancelled before all assets were processed.
    pub cancelled: bool,
}

impl TransformReport {
    fn new(profile: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    /// Number of assets that finished with `status`.
    pub fn count(&self, status: TransformStatus) -> usize {
        self.statuses.values().filter(|s| **s == status).count()
    }
}

impl fmt::Display for TransformReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "profile '{}': {} transformed, {} thumbnails, {} up to date, {} skipped, {} busy, {} failed",
            self.profile,
            self.count(TransformStatus::Transformed),
            self.count(TransformStatus::ThumbnailGenerated),
            self.count(TransformStatus::UpToDate),
            self.count(TransformStatus::Skipped),
            self.count(TransformStatus::Busy),
            self.failures.len()
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

/// Number of assets per [`TransformState`] for one profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformStats {
    pub profile: String,
    pub total: usize,
    pub counts: HashMap<TransformState, usize>,
}

impl TransformStats {
    pub fn count(&self, state: TransformState) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }
}

impl fmt::Display for TransformStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} assets for profile '{}'", self.total, self.profile)?;
        let states = [
            TransformState::Unknown,
            TransformState::UpToDate,
            TransformState::NeedsThumbnail,
            TransformState::NeedsTransform,
            TransformState::MissingDependency,
            TransformState::MissingReference,
            TransformState::TransformError,
        ];
        for state in states {
            writeln!(f, "  {state:<18} {}", self.count(state))?;
        }
        Ok(())
    }
}

/// Removes the key from the in-flight set when the transform is done.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<(AssetGuid, String)>>,
    key: (AssetGuid, String),
}

impl<'a> InFlightGuard<'a> {
    fn acquire(in_flight: &'a Mutex<HashSet<(AssetGuid, String)>>, guid: AssetGuid, profile: &str) -> Option<Self> {
        let key = (guid, profile.to_owned());
        in_flight.lock().insert(key.clone()).then_some(Self { in_flight, key })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

/// What has to be known about an asset to transform it outside of the curator lock.
struct TransformJob {
    guid: AssetGuid,
    path: PathBuf,
    document_type: String,
    generation: u64,
    dependencies: Vec<AssetGuid>,
    evaluation: Evaluation,
}

/// Runs the transformers. At most one transform per asset and profile is in flight.
pub(crate) struct TransformOrchestrator<'a> {
    shared: &'a Shared,
}

impl<'a> TransformOrchestrator<'a> {
    pub(crate) fn new(shared: &'a Shared) -> Self {
        Self { shared }
    }

    pub(crate) fn request_transform(
        &self,
        guid: &AssetGuid,
        profile: &PlatformProfile,
        flags: TransformFlags,
    ) -> Result<TransformStatus> {
        let mut visited = HashSet::new();
        self.transform_recursive(*guid, profile, flags, &mut visited)
    }

    fn transform_recursive(
        &self,
        guid: AssetGuid,
        profile: &PlatformProfile,
        flags: TransformFlags,
        visited: &mut HashSet<AssetGuid>,
    ) -> Result<TransformStatus> {
        // Dependency cycle
        if !visited.insert(guid) {
            return Ok(TransformStatus::Skipped);
        }

        let Some(_in_flight_guard) = InFlightGuard::acquire(&self.shared.in_flight, guid, &profile.name) else {
            info!("Asset {guid} is already being transformed for profile '{}'", profile.name);
            return Ok(TransformStatus::Busy);
        };

        let dependencies = {
            let state = self.shared.state.lock();
            if !state.assets.contains_key(&guid) {
                return Err(Error::UnknownAsset(guid));
            }
            state
                .graph
                .outgoing(&guid, DependencyKind::Transform)
                .into_iter()
                .filter(|dependency| state.assets.contains_key(dependency))
                .collect::<Vec<_>>()
        };
        for dependency in &dependencies {
            let status = self.transform_recursive(*dependency, profile, flags - TransformFlags::FORCE_TRANSFORM, visited)?;
            trace!("Dependency {dependency} of asset {guid}: {status:?}");
        }

        let job = {
            let mut state = self.shared.state.lock();
            let force = flags.contains(TransformFlags::FORCE_TRANSFORM);
            let (evaluation, event) = self.shared.evaluate_and_store(&mut state, &guid, profile, force)?;
            self.shared.events.send_all(event);
            let asset_info = state.assets.get(&guid).ok_or(Error::UnknownAsset(guid))?;
            TransformJob {
                guid,
                path: asset_info.path.clone(),
                document_type: asset_info.document_type.clone(),
                generation: asset_info.generation,
                dependencies: asset_info.dependencies.clone(),
                evaluation,
            }
        };

        match job.evaluation.state {
            TransformState::UpToDate => return Ok(TransformStatus::UpToDate),
            TransformState::Unknown => return Err(Error::AssetNotHashed(guid)),
            TransformState::MissingDependency => {
                return Err(Error::MissingDependency {
                    asset: guid,
                    missing: job.evaluation.missing_dependencies.into_iter().collect(),
                })
            }
            TransformState::MissingReference => {
                return Err(Error::MissingReference {
                    asset: guid,
                    missing: job.evaluation.missing_references.into_iter().collect(),
                })
            }
            TransformState::TransformError => return Err(Error::DocumentTypeNotRegistered(job.document_type)),
            TransformState::NeedsTransform | TransformState::NeedsThumbnail => {}
        }

        let registered = self.shared.registry.read().resolve(&job.document_type)?.clone();
        let type_flags = registered.document_type.flags;
        if type_flags.contains(AssetTypeFlags::DISABLE_TRANSFORM) {
            trace!("Transform of document type '{}' is disabled", job.document_type);
            return Ok(TransformStatus::Skipped);
        }
        if type_flags.contains(AssetTypeFlags::ONLY_TRANSFORM_MANUALLY) && !flags.contains(TransformFlags::TRIGGERED_MANUALLY) {
            trace!("Document type '{}' is only transformed manually", job.document_type);
            return Ok(TransformStatus::Skipped);
        }

        self.run(job, &registered, profile)
    }

    fn run(&self, job: TransformJob, registered: &RegisteredType, profile: &PlatformProfile) -> Result<TransformStatus> {
        let guid = job.guid;
        let layout = &self.shared.layout;
        let dependency_outputs = job
            .dependencies
            .iter()
            .map(|dependency| (*dependency, layout.output_path(&profile.name, dependency)))
            .collect();
        let mut context = TransformContext::new(
            guid,
            &job.path,
            registered.document_type.clone(),
            profile.clone(),
            dependency_outputs,
        );

        info!("Transforming asset {guid} ('{}') for profile '{}'", job.path.display(), profile.name);
        let result = self.write_outputs(&job, registered, profile, &mut context);
        let mut log_entries = context.into_log_entries();

        match result {
            Ok(status) => {
                let mut state = self.shared.state.lock();
                if let Some(asset_info) = state.assets.get_mut(&guid) {
                    asset_info.log_entries = log_entries;
                    asset_info.last_error = None;
                    if asset_info.generation != job.generation {
                        warn!("Asset {guid} changed while it was transformed");
                    }
                }
                match self.shared.evaluate_and_store(&mut state, &guid, profile, false) {
                    Ok((_, event)) => self.shared.events.send_all(event),
                    Err(err) => warn!("Failed to evaluate asset {guid} after the transform: {err}"),
                }
                info!("Transformed asset {guid}: {status:?}");
                Ok(status)
            }
            Err(message) => {
                error!("Failed to transform asset {guid} ('{}'): {message}", job.path.display());
                log_entries.push(LogEntry::new(LogLevel::Error, message.clone()));
                if let Some(asset_info) = self.shared.state.lock().assets.get_mut(&guid) {
                    asset_info.log_entries = log_entries;
                    asset_info.last_error = Some(message.clone());
                }
                Err(Error::TransformFailure { path: job.path, message })
            }
        }
    }

    fn write_outputs(
        &self,
        job: &TransformJob,
        registered: &RegisteredType,
        profile: &PlatformProfile,
        context: &mut TransformContext,
    ) -> std::result::Result<TransformStatus, String> {
        let document_type = &registered.document_type;
        let layout = &self.shared.layout;
        let mut status = TransformStatus::ThumbnailGenerated;

        if job.evaluation.state == TransformState::NeedsTransform {
            let output = registered.transformer.transform(context)?;
            let header = OutputHeader::new(&document_type.name, job.evaluation.asset_hash, document_type.version);
            let path = layout.output_path(&profile.name, &job.guid);
            write_output_file(&path, &header, &output)
                .map_err(|err| format!("Failed to write the output '{}': {err}", path.display()))?;
            status = TransformStatus::Transformed;
        }

        if document_type.flags.contains(AssetTypeFlags::SUPPORTS_THUMBNAIL) && job.evaluation.thumbnail_stale {
            let thumbnail = registered.transformer.generate_thumbnail(context)?;
            let header = OutputHeader::new(THUMBNAIL_FILE_TYPE, job.evaluation.thumb_hash, document_type.version);
            let path = layout.thumbnail_path(&job.guid);
            write_output_file(&path, &header, &thumbnail)
                .map_err(|err| format!("Failed to write the thumbnail '{}': {err}", path.display()))?;
        }

        Ok(status)
    }

    /// A cancel that was requested before the run started stops it right away. The
    /// request is consumed when the run finishes.
    pub(crate) fn transform_all(&self, profile: &PlatformProfile, flags: TransformFlags) -> Result<TransformReport> {
        let guids = self.shared.state.lock().assets.keys().copied().collect::<Vec<_>>();
        info!("Transforming {} assets for profile '{}'", guids.len(), profile.name);

        let mut report = TransformReport::new(&profile.name);
        for guid in guids {
            if self.shared.cancel_requested.load(Ordering::SeqCst) {
                warn!("Transforming all assets for profile '{}' was cancelled", profile.name);
                report.cancelled = true;
                break;
            }
            match self.request_transform(&guid, profile, flags) {
                Ok(status) => {
                    report.statuses.insert(guid, status);
                }
                // Removed while the run was going on
                Err(Error::UnknownAsset(_)) => {}
                Err(err) => report.failures.push(FailedTransform {
                    guid,
                    message: err.to_string(),
                }),
            }
        }
        self.shared.cancel_requested.store(false, Ordering::SeqCst);

        self.write_asset_table(profile)?;
        if !report.cancelled {
            *self.shared.last_full_transform.lock() = Some(Local::now());
        }
        info!("Finished transforming all assets: {report}");
        Ok(report)
    }

    /// Writes the table that maps the GUIDs of all assets with an output to their output file.
    fn write_asset_table(&self, profile: &PlatformProfile) -> Result<()> {
        let layout = &self.shared.layout;
        let guids = self.shared.state.lock().assets.keys().copied().collect::<Vec<_>>();
        let mut table = LookupTable::new();
        for guid in guids {
            let path = layout.output_path(&profile.name, &guid);
            if read_output_record(&path).is_some() {
                let file_name = path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
                table.insert(guid.to_string(), file_name);
            }
        }
        let table_path = layout.asset_table_path(&profile.name);
        table.write(&table_path)?;
        info!("Wrote asset table with {} entries to '{}'", table.len(), table_path.display());
        Ok(())
    }

    pub(crate) fn transform_stats(&self, profile: &PlatformProfile) -> TransformStats {
        let mut stats = TransformStats {
            profile: profile.name.clone(),
            ..Default::default()
        };
        let mut state = self.shared.state.lock();
        let mut events = Vec::new();
        let guids = state.assets.keys().copied().collect::<Vec<_>>();
        for guid in guids {
            match self.shared.evaluate_and_store(&mut state, &guid, profile, false) {
                Ok((evaluation, event)) => {
                    events.extend(event);
                    stats.total += 1;
                    *stats.counts.entry(evaluation.state).or_default() += 1;
                }
                Err(err) => warn!("Failed to evaluate asset {guid}: {err}"),
            }
        }
        self.shared.events.send_all(events);
        stats
    }
}
