//! TwinSync Conflict - Conflict detection and resolution
//!
//! Provides:
//! - Same-target divergence detection across the two replicas
//! - Planning of stored resolutions against the cycle's change set
//! - Keep-both copies under a disambiguated name
//! - Automatic resolution for configured patterns

pub mod detector;
pub mod error;
pub mod namer;
pub mod policy;
pub mod resolver;

pub use detector::{ConflictDetector, DetectedConflict, ScanResult};
pub use error::ConflictError;
pub use namer::ConflictNamer;
pub use policy::PolicyEngine;
pub use resolver::{ConflictResolver, KeepBothAction, ResolutionPlan};
