//! Node status and conflict bookkeeping
//!
//! Every node the engine touches carries a durable [`NodeStatus`]:
//!
//! ```text
//! NEW ──→ IDLE ──→ PENDING ──→ UP / DOWN ──→ IDLE
//!                     │
//!                     └──→ CONFLICT ──(user)──→ SOLVED:* ──→ PENDING
//! ```
//!
//! A [`ConflictRecord`] is the status of a conflicting node together with
//! the snapshots of both divergent changes.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::change::ChangeRecord;
use super::errors::DomainError;
use super::path::NodePath;

/// How a conflict was, or will be, settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The local version wins; the remote change is dropped
    KeepLocal,
    /// The remote version wins; the local change is dropped
    KeepRemote,
    /// The local file is moved aside so both versions survive
    KeepBoth,
}

impl Display for Resolution {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::KeepLocal => write!(f, "keep_local"),
            Resolution::KeepRemote => write!(f, "keep_remote"),
            Resolution::KeepBoth => write!(f, "keep_both"),
        }
    }
}

/// Durable per-node synchronization status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NodeStatus {
    New,
    Idle,
    Pending,
    Up,
    Down,
    Conflict,
    Solved(Resolution),
}

impl NodeStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::New => "NEW",
            NodeStatus::Idle => "IDLE",
            NodeStatus::Pending => "PENDING",
            NodeStatus::Up => "UP",
            NodeStatus::Down => "DOWN",
            NodeStatus::Conflict => "CONFLICT",
            NodeStatus::Solved(Resolution::KeepLocal) => "SOLVED:KEEPLOCAL",
            NodeStatus::Solved(Resolution::KeepRemote) => "SOLVED:KEEPREMOTE",
            NodeStatus::Solved(Resolution::KeepBoth) => "SOLVED:KEEPBOTH",
        }
    }

    /// Marks a conflicting node as settled
    ///
    /// # Errors
    /// Returns `DomainError::InvalidState` unless the node is in conflict
    /// (or already solved, in which case the decision is replaced).
    pub fn resolve(self, resolution: Resolution) -> Result<NodeStatus, DomainError> {
        match self {
            NodeStatus::Conflict | NodeStatus::Solved(_) => Ok(NodeStatus::Solved(resolution)),
            other => Err(DomainError::InvalidState {
                from: other.to_string(),
                to: NodeStatus::Solved(resolution).to_string(),
            }),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, NodeStatus::Conflict)
    }
}

impl Display for NodeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(NodeStatus::New),
            "IDLE" => Ok(NodeStatus::Idle),
            "PENDING" => Ok(NodeStatus::Pending),
            "UP" => Ok(NodeStatus::Up),
            "DOWN" => Ok(NodeStatus::Down),
            "CONFLICT" => Ok(NodeStatus::Conflict),
            "SOLVED:KEEPLOCAL" => Ok(NodeStatus::Solved(Resolution::KeepLocal)),
            "SOLVED:KEEPREMOTE" => Ok(NodeStatus::Solved(Resolution::KeepRemote)),
            "SOLVED:KEEPBOTH" => Ok(NodeStatus::Solved(Resolution::KeepBoth)),
            other => Err(DomainError::InvalidStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for NodeStatus {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeStatus> for String {
    fn from(status: NodeStatus) -> Self {
        status.as_str().to_string()
    }
}

/// The two divergent changes behind a conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDetail {
    pub local: ChangeRecord,
    pub remote: ChangeRecord,
    pub detected_at: DateTime<Utc>,
}

/// A conflicting (or solved, not yet consumed) node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub path: NodePath,
    pub status: NodeStatus,
    pub detail: Option<ConflictDetail>,
}

impl ConflictRecord {
    pub fn open(path: NodePath, detail: ConflictDetail) -> Self {
        Self {
            path,
            status: NodeStatus::Conflict,
            detail: Some(detail),
        }
    }

    /// The stored decision, if the user (or a policy) has made one
    pub fn resolution(&self) -> Option<Resolution> {
        match self.status {
            NodeStatus::Solved(r) => Some(r),
            _ => None,
        }
    }
}
