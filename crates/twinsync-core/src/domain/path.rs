//! Workspace-relative paths
//!
//! [`NodePath`] is the validated form of every path the engine handles on
//! either side. Paths are `/`-rooted, `/`-separated and contain no empty,
//! `.` or `..` segments. The root of the workspace is `/`.
//!
//! A missing path (the NULL source of a create, the NULL target of a delete)
//! is never encoded as a `NodePath`; it is the absence of one.
//!
//! ## Comparison
//!
//! Two paths are compared through their [`PathKey`], which folds case on
//! platforms whose filesystems are case-insensitive (Windows, macOS) and is
//! the identity elsewhere.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

const SEPARATOR: char = '/';

/// Whether the local platform compares file names without regard to case
pub const CASE_INSENSITIVE: bool = cfg!(any(windows, target_os = "macos"));

// ============================================================================
// NodePath
// ============================================================================

/// A normalized, validated workspace-relative path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodePath(String);

impl NodePath {
    /// Creates a new NodePath, normalizing separators
    ///
    /// Backslashes are treated as separators, repeated separators collapse,
    /// and a missing leading `/` is added.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if any segment is `.` or `..`, or
    /// if the path contains a NUL byte.
    pub fn new(path: impl AsRef<str>) -> Result<Self, DomainError> {
        let raw = path.as_ref();
        if raw.contains('\0') {
            return Err(DomainError::InvalidPath(format!(
                "path contains NUL byte: {raw:?}"
            )));
        }

        let mut normalized = String::with_capacity(raw.len() + 1);
        for segment in raw.split(['/', '\\']).filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(DomainError::InvalidPath(format!(
                    "relative segment '{segment}' in {raw}"
                )));
            }
            normalized.push(SEPARATOR);
            normalized.push_str(segment);
        }

        if normalized.is_empty() {
            normalized.push(SEPARATOR);
        }
        Ok(Self(normalized))
    }

    /// The workspace root, `/`
    #[must_use]
    pub fn root() -> Self {
        Self(SEPARATOR.to_string())
    }

    /// Returns true if this is the workspace root
    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    /// Returns the path as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates over the path's segments, root first
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR).filter(|s| !s.is_empty())
    }

    /// Number of segments (0 for the root)
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Returns the parent path, or `None` for the root
    pub fn parent(&self) -> Option<NodePath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind(SEPARATOR) {
            Some(0) => Some(Self::root()),
            Some(pos) => Some(Self(self.0[..pos].to_string())),
            None => None,
        }
    }

    /// Returns the final segment, or `None` for the root
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit(SEPARATOR).next()
    }

    /// Appends a relative path below this one
    pub fn join(&self, relative: &str) -> Result<NodePath, DomainError> {
        Self::new(format!("{}/{}", self.0, relative))
    }

    /// Replaces the final segment
    pub fn with_file_name(&self, name: &str) -> Result<NodePath, DomainError> {
        let parent = self
            .parent()
            .ok_or_else(|| DomainError::InvalidPath("root has no file name".to_string()))?;
        parent.join(name)
    }

    /// The comparison key used for indexing and matching
    pub fn key(&self) -> PathKey {
        if CASE_INSENSITIVE {
            PathKey(self.0.to_lowercase())
        } else {
            PathKey(self.0.clone())
        }
    }

    /// True if `self` and `other` name the same node on this platform
    pub fn same_node(&self, other: &NodePath) -> bool {
        self.key() == other.key()
    }

    /// True if `self` lies strictly below `ancestor`
    pub fn is_strict_descendant_of(&self, ancestor: &NodePath) -> bool {
        let own = self.key();
        let other = ancestor.key();
        if ancestor.is_root() {
            return !self.is_root();
        }
        own.0.len() > other.0.len()
            && own.0.starts_with(&other.0)
            && own.0.as_bytes()[other.0.len()] == SEPARATOR as u8
    }

    /// True if `self` is `ancestor` or lies below it
    pub fn is_within(&self, ancestor: &NodePath) -> bool {
        self.same_node(ancestor) || self.is_strict_descendant_of(ancestor)
    }

    /// Moves this path from below `from` to below `to`
    ///
    /// Returns `None` if `self` is not within `from`.
    pub fn rebase(&self, from: &NodePath, to: &NodePath) -> Option<NodePath> {
        if self.same_node(from) {
            return Some(to.clone());
        }
        if !self.is_strict_descendant_of(from) {
            return None;
        }
        let skip = from.depth();
        let mut rebased = to.0.clone();
        for segment in self.segments().skip(skip) {
            if !rebased.ends_with(SEPARATOR) {
                rebased.push(SEPARATOR);
            }
            rebased.push_str(segment);
        }
        Some(Self(rebased))
    }
}

impl Display for NodePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NodePath {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodePath> for String {
    fn from(path: NodePath) -> Self {
        path.0
    }
}

impl AsRef<str> for NodePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Platform-aware comparison key for a [`NodePath`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathKey(String);

impl PathKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// PathDelta
// ============================================================================

/// A relative move between two paths: climb `ups` levels, then descend
///
/// Deltas compose, so the net displacement of a node across a run of
/// rename events is the composition of each event's delta.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathDelta {
    ups: usize,
    downs: Vec<String>,
}

impl PathDelta {
    /// The delta that leaves any path unchanged
    #[must_use]
    pub fn identity() -> Self {
        Self::default()
    }

    /// The delta that moves `from` onto `to`
    pub fn between(from: &NodePath, to: &NodePath) -> Self {
        let from_segments: Vec<&str> = from.segments().collect();
        let to_segments: Vec<&str> = to.segments().collect();
        let common = from_segments
            .iter()
            .zip(to_segments.iter())
            .take_while(|(a, b)| a == b)
            .count();

        Self {
            ups: from_segments.len() - common,
            downs: to_segments[common..]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Returns true if applying this delta changes nothing
    pub fn is_identity(&self) -> bool {
        self.ups == 0 && self.downs.is_empty()
    }

    /// Composes `self` followed by `next`
    #[must_use]
    pub fn then(&self, next: &PathDelta) -> PathDelta {
        if next.ups <= self.downs.len() {
            let keep = self.downs.len() - next.ups;
            let mut downs = self.downs[..keep].to_vec();
            downs.extend(next.downs.iter().cloned());
            PathDelta {
                ups: self.ups,
                downs,
            }
        } else {
            PathDelta {
                ups: self.ups + (next.ups - self.downs.len()),
                downs: next.downs.clone(),
            }
        }
    }

    /// Applies the delta to `base`; climbing above the root stays at the root
    pub fn apply(&self, base: &NodePath) -> NodePath {
        let mut segments: Vec<&str> = base.segments().collect();
        let keep = segments.len().saturating_sub(self.ups);
        segments.truncate(keep);

        let mut out = String::new();
        for segment in segments.iter().copied().chain(self.downs.iter().map(String::as_str)) {
            out.push(SEPARATOR);
            out.push_str(segment);
        }
        if out.is_empty() {
            out.push(SEPARATOR);
        }
        NodePath(out)
    }
}
