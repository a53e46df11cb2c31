//! Change records
//!
//! A [`ChangeRecord`] is one net semantic change observed on one
//! [`Location`]. Its [`ChangeOp`] is a tagged union, so the shape rules
//! hold by construction:
//!
//! | Kind      | Source   | Target   |
//! |-----------|----------|----------|
//! | `create`  | NULL     | path     |
//! | `content` | path     | path (same) |
//! | `delete`  | path     | NULL     |
//! | `path`    | path     | path (different) |
//!
//! [`RawChangeRow`] is the pre-flattening row shape produced by the change
//! feeds: one per raw event, grouped by entity.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::path::NodePath;

// ============================================================================
// Location
// ============================================================================

/// One of the two replicas being reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Local,
    Remote,
}

impl Location {
    /// The other replica
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Location::Local => Location::Remote,
            Location::Remote => Location::Local,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Location::Local => "local",
            Location::Remote => "remote",
        }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Location {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Location::Local),
            "remote" => Ok(Location::Remote),
            other => Err(DomainError::ValidationFailed(format!(
                "unknown location: {other}"
            ))),
        }
    }
}

// ============================================================================
// ChangeKind / ChangeOp
// ============================================================================

/// Flat label for a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Content,
    Delete,
    Path,
    /// Batched directory creation performed by the applier
    BulkMkdirs,
}

impl ChangeKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Content => "content",
            ChangeKind::Delete => "delete",
            ChangeKind::Path => "path",
            ChangeKind::BulkMkdirs => "bulk_mkdirs",
        }
    }
}

impl Display for ChangeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ChangeKind::Create),
            "content" => Ok(ChangeKind::Content),
            "delete" => Ok(ChangeKind::Delete),
            "path" => Ok(ChangeKind::Path),
            "bulk_mkdirs" => Ok(ChangeKind::BulkMkdirs),
            other => Err(DomainError::ValidationFailed(format!(
                "unknown change kind: {other}"
            ))),
        }
    }
}

/// The operation a change record describes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeOp {
    Create { target: NodePath },
    Content { path: NodePath },
    Delete { source: NodePath },
    Path { source: NodePath, target: NodePath },
}

impl ChangeOp {
    /// Builds a rename/move, rejecting a move onto itself
    pub fn path(source: NodePath, target: NodePath) -> Result<Self, DomainError> {
        if source.same_node(&target) {
            return Err(DomainError::InvalidChange(format!(
                "path change with identical source and target: {source}"
            )));
        }
        Ok(ChangeOp::Path { source, target })
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeOp::Create { .. } => ChangeKind::Create,
            ChangeOp::Content { .. } => ChangeKind::Content,
            ChangeOp::Delete { .. } => ChangeKind::Delete,
            ChangeOp::Path { .. } => ChangeKind::Path,
        }
    }

    /// Source path; NULL for creates
    pub fn source(&self) -> Option<&NodePath> {
        match self {
            ChangeOp::Create { .. } => None,
            ChangeOp::Content { path } => Some(path),
            ChangeOp::Delete { source } | ChangeOp::Path { source, .. } => Some(source),
        }
    }

    /// Target path; NULL for deletes
    pub fn target(&self) -> Option<&NodePath> {
        match self {
            ChangeOp::Create { target } | ChangeOp::Path { target, .. } => Some(target),
            ChangeOp::Content { path } => Some(path),
            ChangeOp::Delete { .. } => None,
        }
    }

    /// The path a change is about: its target, or its source for deletes
    pub fn primary_path(&self) -> &NodePath {
        match self {
            ChangeOp::Create { target } | ChangeOp::Path { target, .. } => target,
            ChangeOp::Content { path } => path,
            ChangeOp::Delete { source } => source,
        }
    }
}

// ============================================================================
// Node metadata
// ============================================================================

/// Content hash of a node; directories carry the `"directory"` marker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeHash {
    Directory,
    File(String),
}

const DIRECTORY_MARKER: &str = "directory";

impl NodeHash {
    pub fn is_directory(&self) -> bool {
        matches!(self, NodeHash::Directory)
    }
}

impl From<String> for NodeHash {
    fn from(value: String) -> Self {
        if value == DIRECTORY_MARKER {
            NodeHash::Directory
        } else {
            NodeHash::File(value)
        }
    }
}

impl From<NodeHash> for String {
    fn from(hash: NodeHash) -> Self {
        match hash {
            NodeHash::Directory => DIRECTORY_MARKER.to_string(),
            NodeHash::File(h) => h,
        }
    }
}

impl Display for NodeHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NodeHash::Directory => f.write_str(DIRECTORY_MARKER),
            NodeHash::File(h) => f.write_str(h),
        }
    }
}

/// Snapshot of a node as reported by a feed or an adapter stat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub hash: NodeHash,
    pub byte_size: u64,
    pub mtime: DateTime<Utc>,
    pub path: NodePath,
}

impl NodeInfo {
    pub fn directory(path: NodePath, mtime: DateTime<Utc>) -> Self {
        Self {
            hash: NodeHash::Directory,
            byte_size: 0,
            mtime,
            path,
        }
    }

    pub fn file(path: NodePath, hash: impl Into<String>, byte_size: u64, mtime: DateTime<Utc>) -> Self {
        Self {
            hash: NodeHash::File(hash.into()),
            byte_size,
            mtime,
            path,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.hash.is_directory()
    }

    /// True if both snapshots describe the same content
    ///
    /// Two directories always match. Files match on hash and size.
    pub fn content_matches(&self, other: &NodeInfo) -> bool {
        match (&self.hash, &other.hash) {
            (NodeHash::Directory, NodeHash::Directory) => true,
            (NodeHash::File(a), NodeHash::File(b)) => a == b && self.byte_size == other.byte_size,
            _ => false,
        }
    }
}

// ============================================================================
// ChangeRecord
// ============================================================================

/// A net semantic change on one location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub location: Location,
    /// Sequence of the last raw event folded into this record
    pub sequence: u64,
    /// Sequence of the first raw event folded into this record
    pub first_sequence: u64,
    pub op: ChangeOp,
    pub content_modified: bool,
    pub node: NodeInfo,
}

impl ChangeRecord {
    pub fn new(location: Location, sequence: u64, op: ChangeOp, node: NodeInfo) -> Self {
        let content_modified = op.kind() == ChangeKind::Content;
        Self {
            location,
            sequence,
            first_sequence: sequence,
            op,
            content_modified,
            node,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        self.op.kind()
    }

    pub fn source(&self) -> Option<&NodePath> {
        self.op.source()
    }

    pub fn target(&self) -> Option<&NodePath> {
        self.op.target()
    }

    pub fn primary_path(&self) -> &NodePath {
        self.op.primary_path()
    }

    pub fn is_dir(&self) -> bool {
        self.node.is_dir()
    }
}

// ============================================================================
// Raw feed rows
// ============================================================================

/// Kind of a raw event row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawKind {
    Create,
    Content,
    Delete,
    Path,
}

/// One raw event from a change feed
///
/// Rows are grouped by `entity_id` and ordered by `seq` within a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChangeRow {
    pub seq: u64,
    pub entity_id: String,
    pub kind: RawKind,
    pub source: Option<NodePath>,
    pub target: Option<NodePath>,
    pub node: NodeInfo,
}
