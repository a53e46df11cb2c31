//! Durable engine state: watermarks, echoes and failure history

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::change::{ChangeKind, ChangeRecord, Location};
use super::errors::DomainError;
use super::path::{NodePath, PathKey};

// ============================================================================
// Watermarks
// ============================================================================

/// Per-location resume points for one job
///
/// Each value is the lowest sequence not yet durably confirmed applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    pub local: u64,
    pub remote: u64,
}

impl Watermarks {
    pub fn get(&self, location: Location) -> u64 {
        match location {
            Location::Local => self.local,
            Location::Remote => self.remote,
        }
    }

    pub fn set(&mut self, location: Location, value: u64) {
        match location {
            Location::Local => self.local = value,
            Location::Remote => self.remote = value,
        }
    }
}

// ============================================================================
// EchoRecord
// ============================================================================

/// An operation the engine itself performed on `location`
///
/// The next cycle drops the first matching change reported by that
/// location's feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoRecord {
    pub location: Location,
    pub kind: ChangeKind,
    pub source: Option<NodePath>,
    pub target: Option<NodePath>,
}

/// Matching key of an echo: location, kind and platform-folded paths
pub type EchoKey = (Location, ChangeKind, Option<PathKey>, Option<PathKey>);

impl EchoRecord {
    pub fn new(
        location: Location,
        kind: ChangeKind,
        source: Option<NodePath>,
        target: Option<NodePath>,
    ) -> Self {
        Self {
            location,
            kind,
            source,
            target,
        }
    }

    pub fn key(&self) -> EchoKey {
        (
            self.location,
            self.kind,
            self.source.as_ref().map(NodePath::key),
            self.target.as_ref().map(NodePath::key),
        )
    }

    /// Key a change record would need to be suppressed by an echo
    pub fn key_for(record: &ChangeRecord) -> EchoKey {
        (
            record.location,
            record.kind(),
            record.source().map(NodePath::key),
            record.target().map(NodePath::key),
        )
    }
}

/// An echo as stored in the buffer
///
/// `matched_seq` is the feed sequence of the change it already suppressed.
/// A bound echo only suppresses that same change again, which happens when
/// the location's watermark is held below it and the feed replays it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedEcho {
    pub id: i64,
    pub echo: EchoRecord,
    pub matched_seq: Option<u64>,
}

impl BufferedEcho {
    pub fn unbound(id: i64, echo: EchoRecord) -> Self {
        Self {
            id,
            echo,
            matched_seq: None,
        }
    }
}

// ============================================================================
// Error classification / failure history
// ============================================================================

/// How a failure affects the running cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// One operation failed; it is retried on the next cycle
    RecoverablePerRecord,
    /// Quota, permission or authentication; the apply phase stops
    FatalPerCycle,
    /// The connection is gone; the cycle backs off offline
    FatalPerConnection,
    /// Pause or stop requested by the user
    UserRequested,
}

impl ErrorClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorClass::RecoverablePerRecord => "recoverable_per_record",
            ErrorClass::FatalPerCycle => "fatal_per_cycle",
            ErrorClass::FatalPerConnection => "fatal_per_connection",
            ErrorClass::UserRequested => "user_requested",
        }
    }
}

impl Display for ErrorClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recoverable_per_record" => Ok(ErrorClass::RecoverablePerRecord),
            "fatal_per_cycle" => Ok(ErrorClass::FatalPerCycle),
            "fatal_per_connection" => Ok(ErrorClass::FatalPerConnection),
            "user_requested" => Ok(ErrorClass::UserRequested),
            other => Err(DomainError::ValidationFailed(format!(
                "unknown error class: {other}"
            ))),
        }
    }
}

/// One entry of the durable failure history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub job_id: String,
    pub location: Location,
    pub kind: ChangeKind,
    pub path: Option<NodePath>,
    pub class: ErrorClass,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

impl FailureEntry {
    pub fn for_record(
        job_id: &str,
        record: &ChangeRecord,
        class: ErrorClass,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            location: record.location,
            kind: record.kind(),
            path: Some(record.primary_path().clone()),
            class,
            message: message.into(),
            failed_at: Utc::now(),
        }
    }
}
