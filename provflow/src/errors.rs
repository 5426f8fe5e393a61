//! Error types for provflow.
//!
//! Each failure family in the taxonomy has a dedicated struct so callers can
//! match on it and read its fields; [`ProvflowError`] wraps them all.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProvflowError>;

/// The main error type for provflow operations.
#[derive(Debug, Error)]
pub enum ProvflowError {
    /// An artifact claims to carry provenance or index data that cannot be parsed.
    #[error("{0}")]
    CorruptArtifact(#[from] CorruptArtifactError),

    /// A chain append was malformed.
    #[error("{0}")]
    InvalidChain(#[from] InvalidChainError),

    /// An operation required at least one step.
    #[error("{0}")]
    EmptyChain(#[from] EmptyChainError),

    /// The existing output was produced by a different pipeline.
    #[error("{0}")]
    IncompatibleProvenance(#[from] IncompatibleProvenanceError),

    /// One of several merge inputs could not be opened.
    #[error("{0}")]
    SourceOpen(#[from] SourceOpenError),

    /// A slice requested a parent that is not in the container.
    #[error("{0}")]
    UnknownParent(#[from] UnknownParentError),

    /// A record violated a stream or container invariant.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// A writer or reader was driven out of order.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The operation was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvflowError {
    /// Creates an invalid record error.
    #[must_use]
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord(message.into())
    }

    /// Creates an invalid state error.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }
}

/// Raised when a chain header (or container index) is present but unusable.
#[derive(Debug, Clone, Error)]
#[error("Corrupt artifact '{}': {reason}", path.display())]
pub struct CorruptArtifactError {
    /// Path of the offending artifact.
    pub path: PathBuf,
    /// What was wrong with it.
    pub reason: String,
}

impl CorruptArtifactError {
    /// Creates a new corrupt artifact error.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Raised on a malformed chain append (a programming error in the caller).
#[derive(Debug, Clone, Error)]
#[error("Invalid chain append at position {position}: {reason}")]
pub struct InvalidChainError {
    /// Index the step would have occupied.
    pub position: usize,
    /// Why the append was rejected.
    pub reason: String,
}

impl InvalidChainError {
    /// Creates a new invalid chain error.
    #[must_use]
    pub fn new(position: usize, reason: impl Into<String>) -> Self {
        Self {
            position,
            reason: reason.into(),
        }
    }
}

/// Raised when the last step of an empty chain is requested.
#[derive(Debug, Clone, Copy, Default, Error)]
#[error("Pipeline chain is empty")]
pub struct EmptyChainError;

/// Raised when an existing output cannot be trusted and no flag allows
/// overwriting it.
#[derive(Debug, Clone, Error)]
#[error(
    "Output '{}' is incompatible at step {}: {detail}. {resolution}",
    path.display(),
    step_index.map_or_else(|| "-".to_string(), |i| i.to_string())
)]
pub struct IncompatibleProvenanceError {
    /// The output path the gate evaluated.
    pub path: PathBuf,
    /// First step index at which the chains diverge, if any.
    pub step_index: Option<usize>,
    /// Action the current invocation would record at that index.
    pub expected_action: Option<String>,
    /// Action recorded in the existing output at that index.
    pub existing_action: Option<String>,
    /// Human-readable description of the difference.
    pub detail: String,
    /// Which flag resolves the conflict.
    pub resolution: String,
}

/// Raised when opening one of several merge inputs fails.
#[derive(Debug, Error)]
#[error("Failed to open merge source #{index} ({description}): {source}")]
pub struct SourceOpenError {
    /// Zero-based index of the source in the merge.
    pub index: usize,
    /// Human-readable description of the source (usually a path).
    pub description: String,
    /// Underlying cause.
    #[source]
    pub source: std::io::Error,
}

impl SourceOpenError {
    /// Creates a new source open error.
    #[must_use]
    pub fn new(index: usize, description: impl Into<String>, source: std::io::Error) -> Self {
        Self {
            index,
            description: description.into(),
            source,
        }
    }
}

/// Raised when a slice names a parent that the container does not hold.
#[derive(Debug, Clone, Copy, Error)]
#[error("Unknown parent id {parent_id}")]
pub struct UnknownParentError {
    /// The offending identifier.
    pub parent_id: i32,
}
