//! Error types for the self-modification core.

use std::path::PathBuf;

use crate::features::FeatureStatus;

/// Top-level error type for staging, apply, revert and safe-mode operations.
#[derive(Debug, thiserror::Error)]
pub enum SelfModError {
    /// Filesystem failure with the path that caused it.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// State could not be serialized.
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    /// A caller-supplied relative or virtual path was rejected.
    #[error("invalid path `{path}`: {reason}")]
    InvalidPath { path: String, reason: String },

    /// The operation needs an existing feature.
    #[error("feature not found: {0}")]
    FeatureNotFound(String),

    /// The operation needs an existing changeset.
    #[error("changeset not found: {0}")]
    ChangesetNotFound(String),

    /// The changeset was already completed or rolled back.
    #[error("changeset {id} is already {status}")]
    ChangesetClosed { id: String, status: String },

    /// A batch snapshot left by an interrupted apply cannot be read, so the
    /// batch cannot be retried without losing its pre-apply content.
    #[error("snapshot for batch {batch_index} of feature {feature_id} is unreadable: {path}")]
    UnreadableBatchSnapshot {
        feature_id: String,
        batch_index: usize,
        path: PathBuf,
    },

    /// Status change not allowed by the feature lifecycle.
    #[error("feature {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: FeatureStatus,
        to: FeatureStatus,
    },

    /// No last-known-good baseline has been recorded yet.
    #[error("no last-known-good baseline recorded")]
    NoBaseline,

    /// The baseline metadata points at a snapshot that cannot be loaded.
    #[error("baseline snapshot missing: {0}")]
    BaselineSnapshotMissing(PathBuf),

    /// The boot id no longer matches the current boot record.
    #[error("boot {requested} is stale (current boot: {current})")]
    StaleBoot { requested: String, current: String },

    /// A write failed partway through an apply batch.
    #[error("apply of batch {batch_index} for feature {feature_id} failed (rolled back: {rolled_back}): {source}")]
    ApplyFailed {
        feature_id: String,
        batch_index: usize,
        rolled_back: bool,
        #[source]
        source: Box<SelfModError>,
    },

    /// Invalid configuration file or value.
    #[error("config error: {0}")]
    Config(String),
}

impl SelfModError {
    /// Wrap an `std::io::Error` with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SelfModError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        SelfModError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SelfModError>;
