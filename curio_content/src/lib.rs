//! # Overview
//!
//! Incremental, dependency-aware build orchestration for asset documents.
//!
//! A [`Curator`] keeps track of every asset document in a set of data directories.
//! Each document starts with a YAML header that names its stable GUID, its document
//! type and the GUIDs of the assets it depends on or references:
//!
//! ```text
//! ---
//! guid: 67e55044-10b1-426f-9247-bb680e5fe0c8
//! type: Material
//! dependencies: [0d3f1b9e-4c7a-4f5e-8b2d-6a9c1e7f3b40]
//! references: []
//! ---
//! ...
//! ```
//!
//! Files are hashed on a background thread. From the content hashes and the
//! dependency graph the curator derives an asset hash per platform profile. An output
//! file records the asset hash it was built from, so an asset only has to be
//! transformed again when its own content, one of its transitive dependencies, the
//! platform profile or the version of its [`Transformer`] changed.
//!
//! # Output Directory
//!
//! ```text
//! output/
//! ├─ PC/
//! │  ├─ 67e55044-10b1-426f-9247-bb680e5fe0c8.asset
//! │  ├─ AssetTable.txt
//! ├─ Thumbnails/
//! │  ├─ 67e55044-10b1-426f-9247-bb680e5fe0c8.thumb
//! ├─ curator.cache
//! ```
//!
//! The layout of the output files is described in [`asset_file`].

pub mod asset_file;
mod asset_info;
mod cache;
mod common;
mod config;
mod curator;
mod dependency_graph;
mod evaluator;
mod event;
mod file_status;
mod hash_worker;
mod hasher;
mod lookup_table;
mod orchestrator;
mod profile;
mod scanner;
mod state;
mod transformer;
mod watcher;

pub use asset_info::*;
pub use common::{normalize_path, AssetGuid, Error, Result};
pub use config::*;
pub use curator::{CancelHandle, Curator, RemoteTransformRequest, RemoteTransformResponse};
pub use dependency_graph::{DependencyGraph, DependencyKind};
pub use evaluator::Evaluation;
pub use event::CuratorEvent;
pub use file_status::{FileStatus, Liveness};
pub use hasher::{combine_hashes, stable_hash64, AssetHeader, StableHasher};
pub use lookup_table::*;
pub use orchestrator::{FailedTransform, TransformReport, TransformStats, TransformStatus};
pub use profile::*;
pub use scanner::ScanStats;
pub use transformer::*;
pub use watcher::CuratorWatcher;
