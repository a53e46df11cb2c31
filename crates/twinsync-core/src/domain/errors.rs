//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! including path validation failures and malformed change records.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// A change record whose source/target combination violates its kind
    #[error("Invalid change record: {0}")]
    InvalidChange(String),

    /// Unknown node status string
    #[error("Invalid node status: {0}")]
    InvalidStatus(String),

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
