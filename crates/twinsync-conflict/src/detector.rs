//! Conflict detection logic
//!
//! Pairs still-pending changes from opposite replicas that target the same
//! path and compares their content. A pair whose hash or size differ, or
//! where one side is a directory and the other a file, is a conflict.
//!
//! Pairs of content-carrying changes (`create`/`content`) that agree are
//! reported as converged: both replicas already hold the same bytes.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, info};

use twinsync_core::domain::{ChangeKind, ChangeRecord, ConflictDetail, Location, NodePath, PathKey};

/// A conflict found in the cycle's change set
#[derive(Debug, Clone)]
pub struct DetectedConflict {
    pub path: NodePath,
    pub local_id: u64,
    pub remote_id: u64,
    pub detail: ConflictDetail,
}

/// Outcome of one detection pass
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// One entry per conflicting path
    pub conflicts: Vec<DetectedConflict>,
    /// `(local_id, remote_id)` pairs that already agree
    pub converged: Vec<(u64, u64)>,
}

impl ScanResult {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

#[derive(Default)]
struct TargetPair<'a> {
    local: Vec<(u64, &'a ChangeRecord)>,
    remote: Vec<(u64, &'a ChangeRecord)>,
}

/// Detects conflicts between local and remote changes
pub struct ConflictDetector;

impl ConflictDetector {
    /// Scans `records` (id, record) for same-target divergence
    pub fn scan<'a, I>(records: I) -> ScanResult
    where
        I: IntoIterator<Item = (u64, &'a ChangeRecord)>,
    {
        let mut by_target: BTreeMap<PathKey, TargetPair<'a>> = BTreeMap::new();
        for (id, record) in records {
            let Some(target) = record.target() else {
                continue;
            };
            let entry = by_target.entry(target.key()).or_default();
            match record.location {
                Location::Local => entry.local.push((id, record)),
                Location::Remote => entry.remote.push((id, record)),
            }
        }

        let mut result = ScanResult::default();
        for pair in by_target.values() {
            if pair.local.is_empty() || pair.remote.is_empty() {
                continue;
            }

            let divergent = pair.local.iter().find_map(|&(local_id, local)| {
                pair.remote
                    .iter()
                    .find(|(_, remote)| !local.node.content_matches(&remote.node))
                    .map(|&(remote_id, remote)| (local_id, local, remote_id, remote))
            });

            if let Some((local_id, local, remote_id, remote)) = divergent {
                let path = local.primary_path().clone();
                info!(
                    path = %path,
                    local_kind = %local.kind(),
                    remote_kind = %remote.kind(),
                    "Conflict detected: both replicas changed the same target"
                );
                result.conflicts.push(DetectedConflict {
                    path,
                    local_id,
                    remote_id,
                    detail: ConflictDetail {
                        local: local.clone(),
                        remote: remote.clone(),
                        detected_at: Utc::now(),
                    },
                });
                continue;
            }

            let mut used_remote: Vec<u64> = Vec::new();
            for &(local_id, _) in pair.local.iter().filter(|(_, r)| carries_content(r)) {
                let partner = pair
                    .remote
                    .iter()
                    .find(|(id, r)| carries_content(r) && !used_remote.contains(id));
                if let Some(&(remote_id, _)) = partner {
                    used_remote.push(remote_id);
                    result.converged.push((local_id, remote_id));
                }
            }
        }

        debug!(
            conflicts = result.conflicts.len(),
            converged = result.converged.len(),
            "Conflict scan complete"
        );
        result
    }
}

fn carries_content(record: &ChangeRecord) -> bool {
    matches!(record.kind(), ChangeKind::Create | ChangeKind::Content)
}
