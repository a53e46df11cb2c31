//! Error types for the conflict engine

use thiserror::Error;

use twinsync_core::ports::AdapterError;

/// Errors that can occur during conflict detection and resolution
#[derive(Debug, Error)]
pub enum ConflictError {
    /// Resolution operation failed (move aside, naming)
    #[error("resolution failed: {0}")]
    ResolutionFailed(String),

    /// Conflict not found in repository
    #[error("conflict not found: {0}")]
    NotFound(String),

    /// Invalid glob pattern in conflict rule
    #[error("invalid glob pattern: {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The local adapter refused an operation
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}
