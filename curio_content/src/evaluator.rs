use std::collections::BTreeSet;

use curio_shared::log::trace;

use crate::{
    asset_file::{read_output_record, OutputLayout},
    asset_info::{OutputRecord, TransformState},
    hasher::combine_hashes,
    profile::PlatformProfile,
    state::CuratorState,
    transformer::{AssetTypeFlags, TransformerRegistry},
    AssetGuid, Error, Result,
};

/// Result of [`TransformStateEvaluator::evaluate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub state: TransformState,
    /// `0` unless all transform dependencies are known.
    pub asset_hash: u64,
    /// `0` unless all references are known.
    pub thumb_hash: u64,
    pub missing_dependencies: BTreeSet<AssetGuid>,
    pub missing_references: BTreeSet<AssetGuid>,
    pub existing_output: Option<OutputRecord>,
    pub existing_thumbnail: Option<OutputRecord>,
    /// `existing_thumbnail` has been read from the thumbnail directory.
    pub thumbnail_checked: bool,
    /// The document type supports thumbnails and the existing one doesn't match `thumb_hash`.
    pub thumbnail_stale: bool,
}

/// Decides whether the output of an asset is current. Apart from reading output
/// headers it only looks at the in-memory state, which therefore has to be current.
pub struct TransformStateEvaluator<'a> {
    state: &'a CuratorState,
    registry: &'a TransformerRegistry,
    layout: &'a OutputLayout,
}

impl<'a> TransformStateEvaluator<'a> {
    pub fn new(state: &'a CuratorState, registry: &'a TransformerRegistry, layout: &'a OutputLayout) -> Self {
        Self { state, registry, layout }
    }

    pub fn evaluate(&self, guid: &AssetGuid, profile: &PlatformProfile, force: bool) -> Result<Evaluation> {
        let asset_info = self.state.assets.get(guid).ok_or(Error::UnknownAsset(*guid))?;
        let mut evaluation = Evaluation::default();

        if self.state.content_hash(guid).unwrap_or(0) == 0 {
            return Ok(evaluation);
        }

        let content_hash = |guid: &AssetGuid| self.state.content_hash(guid);
        match self.state.graph.compute_transitive_hash(guid, content_hash) {
            Ok(transitive_hash) => evaluation.asset_hash = combine_hashes(transitive_hash, profile.identity_hash()),
            Err(missing) => {
                trace!("Asset {guid} is missing the dependencies {missing:?}");
                evaluation.missing_dependencies = missing;
                evaluation.state = TransformState::MissingDependency;
                return Ok(evaluation);
            }
        }

        match self.state.graph.compute_reference_hash(guid, content_hash) {
            Ok(thumb_hash) => evaluation.thumb_hash = thumb_hash,
            Err(missing) => {
                trace!("Asset {guid} is missing the references {missing:?}");
                evaluation.missing_references = missing;
                evaluation.state = TransformState::MissingReference;
                return Ok(evaluation);
            }
        }

        let Some(registered) = self.registry.get(&asset_info.document_type) else {
            trace!("No transformer registered for document type '{}'", asset_info.document_type);
            evaluation.state = TransformState::TransformError;
            return Ok(evaluation);
        };
        let document_type = &registered.document_type;

        evaluation.existing_output = read_output_record(&self.layout.output_path(&profile.name, guid));
        if document_type.flags.contains(AssetTypeFlags::SUPPORTS_THUMBNAIL) {
            evaluation.existing_thumbnail = read_output_record(&self.layout.thumbnail_path(guid));
            evaluation.thumbnail_checked = true;
            let expected = OutputRecord {
                hash: evaluation.thumb_hash,
                version: document_type.version,
            };
            evaluation.thumbnail_stale = evaluation.existing_thumbnail != Some(expected);
        }

        if force {
            evaluation.state = TransformState::NeedsTransform;
            return Ok(evaluation);
        }

        let expected_output = OutputRecord {
            hash: evaluation.asset_hash,
            version: document_type.version,
        };
        evaluation.state = if evaluation.existing_output != Some(expected_output) {
            TransformState::NeedsTransform
        } else if evaluation.thumbnail_stale {
            if document_type.flags.contains(AssetTypeFlags::AUTO_THUMBNAIL_ON_TRANSFORM) {
                TransformState::NeedsTransform
            } else {
                TransformState::NeedsThumbnail
            }
        } else {
            TransformState::UpToDate
        };
        Ok(evaluation)
    }
}
