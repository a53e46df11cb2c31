//! Conflict resolution
//!
//! Turns stored `SOLVED:*` statuses into edits of the cycle's change set:
//! - `KeepLocal`: drop the remote-origin changes for the path
//! - `KeepRemote`: drop the local-origin changes for the path
//! - `KeepBoth`: move the local file aside under a conflict name, then
//!   drop the local-origin change so the remote version lands on the path
//!
//! Planning is pure; only the keep-both move touches a replica.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use twinsync_core::domain::{ChangeRecord, ConflictRecord, Location, NodePath, PathKey, Resolution};
use twinsync_core::ports::ISyncAdapter;

use crate::error::ConflictError;
use crate::namer::{ConflictNamer, MAX_NUMBERED_ATTEMPTS};

/// A local change whose file must be moved aside before it is dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepBothAction {
    pub local_id: u64,
    pub path: NodePath,
}

/// What the stored resolutions mean for the current change set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionPlan {
    /// Record ids to remove from the change set
    pub drop: Vec<u64>,
    /// Local records to settle by keeping both versions
    pub keep_both: Vec<KeepBothAction>,
    /// Solved paths with changes still to apply; they move to PENDING
    pub consumed: Vec<NodePath>,
    /// Solved paths with nothing left in the change set; they move to IDLE
    pub stale: Vec<NodePath>,
}

impl ResolutionPlan {
    /// Matches every solved conflict against the records targeting its path
    pub fn build<'a, I>(conflicts: &[ConflictRecord], records: I) -> Self
    where
        I: IntoIterator<Item = (u64, &'a ChangeRecord)>,
    {
        let mut by_target: HashMap<PathKey, Vec<(u64, Location)>> = HashMap::new();
        for (id, record) in records {
            if let Some(target) = record.target() {
                by_target
                    .entry(target.key())
                    .or_default()
                    .push((id, record.location));
            }
        }

        let mut plan = ResolutionPlan::default();
        for conflict in conflicts {
            let Some(resolution) = conflict.resolution() else {
                continue;
            };
            let Some(targeting) = by_target.get(&conflict.path.key()) else {
                plan.stale.push(conflict.path.clone());
                continue;
            };

            for &(id, location) in targeting {
                match (resolution, location) {
                    (Resolution::KeepLocal, Location::Remote)
                    | (Resolution::KeepRemote, Location::Local) => plan.drop.push(id),
                    (Resolution::KeepBoth, Location::Local) => plan.keep_both.push(KeepBothAction {
                        local_id: id,
                        path: conflict.path.clone(),
                    }),
                    _ => {}
                }
            }
            plan.consumed.push(conflict.path.clone());
        }

        debug!(
            dropped = plan.drop.len(),
            keep_both = plan.keep_both.len(),
            consumed = plan.consumed.len(),
            stale = plan.stale.len(),
            "Resolution plan built"
        );
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.drop.is_empty()
            && self.keep_both.is_empty()
            && self.consumed.is_empty()
            && self.stale.is_empty()
    }
}

/// Performs the replica-side part of keep-both resolutions
pub struct ConflictResolver {
    local: Arc<dyn ISyncAdapter>,
}

impl ConflictResolver {
    pub fn new(local: Arc<dyn ISyncAdapter>) -> Self {
        Self { local }
    }

    /// Renames the local file at `path` to a free conflict-copy name
    ///
    /// Returns the new path.
    #[instrument(skip(self), fields(path = %path))]
    pub async fn move_local_aside(&self, path: &NodePath) -> Result<NodePath, ConflictError> {
        let name = path
            .file_name()
            .ok_or_else(|| ConflictError::ResolutionFailed("cannot move the root aside".into()))?;

        if self.local.stat(path, false).await?.is_none() {
            return Err(ConflictError::NotFound(path.to_string()));
        }

        let aside = self.free_name(path, name).await?;
        self.local.move_node(path, &aside).await?;

        info!(aside = %aside, "Local version kept as conflict copy");
        Ok(aside)
    }

    async fn free_name(&self, path: &NodePath, name: &str) -> Result<NodePath, ConflictError> {
        let candidate = ConflictNamer::generate(name);
        let first = with_name(path, &candidate)?;
        if self.local.stat(&first, false).await?.is_none() {
            return Ok(first);
        }

        // Extremely unlikely with UUID, but handle it
        for n in 2..=MAX_NUMBERED_ATTEMPTS {
            let numbered = with_name(path, &ConflictNamer::numbered(&candidate, n))?;
            if self.local.stat(&numbered, false).await?.is_none() {
                return Ok(numbered);
            }
        }

        with_name(path, &ConflictNamer::last_resort(name))
    }
}

fn with_name(path: &NodePath, name: &str) -> Result<NodePath, ConflictError> {
    path.with_file_name(name)
        .map_err(|e| ConflictError::ResolutionFailed(e.to_string()))
}
