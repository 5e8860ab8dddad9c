//! Engine-level error type.

use std::path::PathBuf;

use thiserror::Error;

use crate::{meta::store::MetaError, store::StorageMedium};

/// Errors surfaced by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine options are unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Two volumes claim different cluster ids.
    #[error("cluster id conflict: {left} vs {right}")]
    ClusterIdConflict {
        /// Id seen first.
        left: i32,
        /// Conflicting id.
        right: i32,
    },
    /// Engine startup could not complete.
    #[error("engine init failed: {0}")]
    InitFailed(String),
    /// A volume failed to load.
    #[error("failed to load volume {path}: {source}")]
    VolumeLoad {
        /// Root of the failing volume.
        path: PathBuf,
        /// Underlying failure.
        source: Box<EngineError>,
    },
    /// A persisted record could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),
    /// A requested object does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// An object with the same identity already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// No usable volume matches the requested medium.
    #[error("no available volume of medium {0:?}")]
    NoAvailableVolume(StorageMedium),
    /// Too many volumes have gone unusable to keep running.
    #[error("{unused} of {total} volumes are unusable")]
    DiskExhaustion {
        /// Volumes currently unusable.
        unused: usize,
        /// Volumes configured.
        total: usize,
    },
    /// Metadata store failure.
    #[error(transparent)]
    Meta(#[from] MetaError),
    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
