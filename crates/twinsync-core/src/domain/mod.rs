//! Domain types for the reconciliation engine
//!
//! This module contains:
//! - Validated workspace paths and path deltas
//! - Semantic change records and raw feed rows
//! - Node status and conflict bookkeeping
//! - Watermarks, echo records and failure history entries
//! - Domain-specific error types

pub mod change;
pub mod errors;
pub mod path;
pub mod state;
pub mod status;

// Re-export commonly used types
pub use change::{
    ChangeKind, ChangeOp, ChangeRecord, Location, NodeHash, NodeInfo, RawChangeRow, RawKind,
};
pub use errors::DomainError;
pub use path::{NodePath, PathDelta, PathKey};
pub use state::{BufferedEcho, EchoKey, EchoRecord, ErrorClass, FailureEntry, Watermarks};
pub use status::{ConflictDetail, ConflictRecord, NodeStatus, Resolution};
