//! TwinSync Sync - Reconciliation engine
//!
//! Provides:
//! - Flattening of raw per-entity change logs into net changes
//! - The per-cycle Change Store and its reduction pipeline
//! - Bounded-concurrency application of the surviving changes
//! - The cycle orchestrator with online/offline backoff
//!
//! ## Modules
//!
//! - [`flattener`] - Raw event groups to 0-2 semantic changes
//! - [`store`] - Indexed per-cycle working set of changes
//! - [`reduce`] - Dedup, unnecessary-change and folder-move pruning stages
//! - [`filter`] - Include/exclude globs and echo suppression at ingestion
//! - [`processor`] - Maps one change onto adapter calls
//! - [`applier`] - Three-phase apply with watermark checkpoints
//! - [`control`] - Pause/resume/stop, progress channels, conflict decisions
//! - [`engine`] - The sync cycle state machine
//! - [`filesystem`] - Local directory adapter (tokio::fs, SHA-256)
//! - [`logging`] - tracing subscriber initialisation

pub mod applier;
pub mod control;
pub mod engine;
pub mod filesystem;
pub mod filter;
pub mod flattener;
pub mod logging;
pub mod processor;
pub mod reduce;
pub mod store;

use thiserror::Error;

use twinsync_conflict::ConflictError;
use twinsync_core::domain::{DomainError, ErrorClass};
use twinsync_core::ports::AdapterError;

/// Errors that can end a synchronization cycle
#[derive(Debug, Error)]
pub enum SyncError {
    /// A replica adapter or change feed failed
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Conflict resolution failed
    #[error("Conflict error: {0}")]
    Conflict(#[from] ConflictError),

    /// A domain-level error propagated from twinsync-core
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// The state repository failed
    #[error("State storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// The job configuration was rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The job was stopped
    #[error("Job stopped")]
    Stopped,
}

impl SyncError {
    /// How the failure affects the job loop
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Adapter(e) => e.class(),
            SyncError::Conflict(ConflictError::Adapter(e)) => e.class(),
            SyncError::Stopped => ErrorClass::UserRequested,
            _ => ErrorClass::FatalPerCycle,
        }
    }
}
