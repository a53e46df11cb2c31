//! Reduction pipeline over the Change Store
//!
//! Stages run in a fixed order, each one idempotent:
//!
//! 1. [`delete_copies`] - collapse exact duplicates on one location
//! 2. [`dedup_across_sides`] - drop a local/remote pair describing the same
//!    change; then [`yield_deletes_to_edits`] drops a delete whose path the
//!    other side changed
//! 3. [`detect_unnecessary_changes`] - drop changes the other side already
//!    reflects (bulk stat of both replicas)
//! 4. [`prune_folder_moves`] - fold descendant deletes/moves into their
//!    ancestor directory's delete or move
//!
//! Conflict detection runs after these, in the orchestrator.

use std::collections::{HashMap, HashSet};

use tracing::{debug, instrument, trace};

use twinsync_core::domain::{
    ChangeKind, ChangeOp, ChangeRecord, Location, NodeHash, NodeInfo, NodePath, PathKey,
};
use twinsync_core::ports::{AdapterError, ISyncAdapter};

use crate::store::{ChangeStore, RecordId};

/// How many records each stage removed or rewrote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReductionReport {
    pub copies: usize,
    pub cross_side: usize,
    pub deletes_yielded: usize,
    pub unnecessary: usize,
    pub folder_moves: usize,
}

impl ReductionReport {
    pub fn total(&self) -> usize {
        self.copies + self.cross_side + self.deletes_yielded + self.unnecessary + self.folder_moves
    }
}

/// Runs stages 1-4
///
/// `check_unnecessary` is the job's unnecessary-change policy resolved for
/// this cycle.
#[instrument(skip_all, fields(records = store.len()))]
pub async fn run_pipeline(
    store: &mut ChangeStore,
    local: &dyn ISyncAdapter,
    remote: &dyn ISyncAdapter,
    check_unnecessary: bool,
) -> Result<ReductionReport, AdapterError> {
    let mut report = ReductionReport {
        copies: delete_copies(store),
        cross_side: dedup_across_sides(store),
        deletes_yielded: yield_deletes_to_edits(store),
        ..ReductionReport::default()
    };
    if check_unnecessary {
        report.unnecessary = detect_unnecessary_changes(store, local, remote).await?;
    }
    report.folder_moves = prune_folder_moves(store);

    debug!(
        copies = report.copies,
        cross_side = report.cross_side,
        deletes_yielded = report.deletes_yielded,
        unnecessary = report.unnecessary,
        folder_moves = report.folder_moves,
        remaining = store.len(),
        "Change store reduced"
    );
    Ok(report)
}

// ============================================================================
// Stage 1: delete copies
// ============================================================================

type CopyKey = (
    Location,
    ChangeKind,
    Option<PathKey>,
    Option<PathKey>,
    bool,
    NodeHash,
    u64,
);

fn copy_key(record: &ChangeRecord) -> CopyKey {
    (
        record.location,
        record.kind(),
        record.source().map(NodePath::key),
        record.target().map(NodePath::key),
        record.content_modified,
        record.node.hash.clone(),
        record.node.byte_size,
    )
}

/// Collapses exact duplicates, keeping the most recent sequence
///
/// The survivor inherits the lowest `first_sequence` of its copies.
pub fn delete_copies(store: &mut ChangeStore) -> usize {
    let mut groups: HashMap<CopyKey, Vec<RecordId>> = HashMap::new();
    for (id, record) in store.iter() {
        groups.entry(copy_key(record)).or_default().push(id);
    }

    let mut removed = 0;
    for ids in groups.into_values().filter(|ids| ids.len() > 1) {
        let Some(&keep) = ids
            .iter()
            .max_by_key(|id| store.get(**id).map(|r| (r.sequence, **id)))
        else {
            continue;
        };

        let mut first_sequence = u64::MAX;
        for &id in &ids {
            if id == keep {
                continue;
            }
            if let Some(copy) = store.remove(id) {
                first_sequence = first_sequence.min(copy.first_sequence);
                removed += 1;
            }
        }

        if let Some(mut survivor) = store.get(keep).cloned() {
            if first_sequence < survivor.first_sequence {
                survivor.first_sequence = first_sequence;
                store.replace(keep, survivor);
            }
        }
    }
    removed
}

// ============================================================================
// Stage 2: dedup across sides
// ============================================================================

fn same_change(local: &ChangeRecord, remote: &ChangeRecord) -> bool {
    if local.kind() != remote.kind() {
        return false;
    }
    // a delete carries the last snapshot each side had; the paths suffice
    local.kind() == ChangeKind::Delete
        || (local.node.hash == remote.node.hash && local.node.byte_size == remote.node.byte_size)
}

/// Removes local/remote pairs that describe the same change
///
/// Pairs where both sides changed content are left for conflict detection.
pub fn dedup_across_sides(store: &mut ChangeStore) -> usize {
    let local_ids: Vec<RecordId> = store
        .iter()
        .filter(|(_, record)| record.location == Location::Local)
        .map(|(id, _)| id)
        .collect();

    let mut removed = 0;
    for local_id in local_ids {
        let Some(local) = store.get(local_id).cloned() else {
            continue;
        };
        let partner = store
            .ids_with_triple(Location::Remote, local.source(), local.target())
            .into_iter()
            .find(|id| {
                store.get(*id).is_some_and(|remote| {
                    same_change(&local, remote) && !(local.content_modified && remote.content_modified)
                })
            });

        if let Some(remote_id) = partner {
            trace!(path = %local.primary_path(), kind = %local.kind(), "Both sides made the same change");
            store.remove(local_id);
            store.remove(remote_id);
            removed += 2;
        }
    }
    removed
}

/// Drops deletes of paths the opposite side created, edited or moved onto
///
/// The surviving change recreates the node on the deleting side, so no
/// update is lost.
pub fn yield_deletes_to_edits(store: &mut ChangeStore) -> usize {
    let doomed: Vec<RecordId> = store
        .iter()
        .filter(|(_, record)| record.kind() == ChangeKind::Delete)
        .filter(|(_, record)| {
            record.source().is_some_and(|source| {
                store.ids_targeting(source).into_iter().any(|id| {
                    store
                        .get(id)
                        .is_some_and(|other| other.location != record.location)
                })
            })
        })
        .map(|(id, _)| id)
        .collect();

    for id in &doomed {
        if let Some(record) = store.remove(*id) {
            debug!(
                location = %record.location,
                path = %record.primary_path(),
                "Delete yields to a change on the other side"
            );
        }
    }
    doomed.len()
}

// ============================================================================
// Stage 3: unnecessary-change filter
// ============================================================================

#[derive(Default)]
struct StatBatch {
    hashed: Vec<NodePath>,
    plain: Vec<NodePath>,
    seen_hashed: HashSet<PathKey>,
    seen_plain: HashSet<PathKey>,
}

impl StatBatch {
    fn want(&mut self, path: &NodePath, with_hash: bool) {
        if with_hash {
            if self.seen_hashed.insert(path.key()) {
                self.hashed.push(path.clone());
            }
        } else if self.seen_plain.insert(path.key()) {
            self.plain.push(path.clone());
        }
    }

    async fn run(
        self,
        adapter: &dyn ISyncAdapter,
    ) -> Result<HashMap<PathKey, NodeInfo>, AdapterError> {
        let mut found = HashMap::new();
        if !self.hashed.is_empty() {
            found = adapter.bulk_stat(&self.hashed, true).await?;
        }
        let plain: Vec<NodePath> = self
            .plain
            .into_iter()
            .filter(|path| !self.seen_hashed.contains(&path.key()))
            .collect();
        if !plain.is_empty() {
            found.extend(adapter.bulk_stat(&plain, false).await?);
        }
        Ok(found)
    }
}

fn is_unnecessary(
    record: &ChangeRecord,
    origin: &HashMap<PathKey, NodeInfo>,
    opposite: &HashMap<PathKey, NodeInfo>,
) -> bool {
    let on_opposite = |path: &NodePath| opposite.get(&path.key());
    match &record.op {
        ChangeOp::Create { target } | ChangeOp::Content { path: target } => {
            on_opposite(target).is_some_and(|info| record.node.content_matches(info))
        }
        ChangeOp::Delete { source } => {
            on_opposite(source).is_none() || origin.contains_key(&source.key())
        }
        ChangeOp::Path { source, target } => {
            on_opposite(target).is_some_and(|info| record.node.content_matches(info))
                && on_opposite(source).is_none()
        }
    }
}

/// Drops changes the opposite replica already reflects
///
/// - `create`/`content`: the opposite side holds matching content
/// - `delete`: the source is already gone there, or is back on the origin
/// - `path`: the target matches there and the source is gone
#[instrument(skip_all)]
pub async fn detect_unnecessary_changes(
    store: &mut ChangeStore,
    local: &dyn ISyncAdapter,
    remote: &dyn ISyncAdapter,
) -> Result<usize, AdapterError> {
    if store.is_empty() {
        return Ok(0);
    }

    let mut local_batch = StatBatch::default();
    let mut remote_batch = StatBatch::default();
    for (_, record) in store.iter() {
        let (origin, opposite) = match record.location {
            Location::Local => (&mut local_batch, &mut remote_batch),
            Location::Remote => (&mut remote_batch, &mut local_batch),
        };
        match &record.op {
            ChangeOp::Create { target } | ChangeOp::Content { path: target } => {
                opposite.want(target, true);
            }
            ChangeOp::Delete { source } => {
                opposite.want(source, false);
                origin.want(source, false);
            }
            ChangeOp::Path { source, target } => {
                opposite.want(target, true);
                opposite.want(source, false);
            }
        }
    }

    let on_local = local_batch.run(local).await?;
    let on_remote = remote_batch.run(remote).await?;

    let doomed: Vec<RecordId> = store
        .iter()
        .filter(|(_, record)| {
            let (origin, opposite) = match record.location {
                Location::Local => (&on_local, &on_remote),
                Location::Remote => (&on_remote, &on_local),
            };
            is_unnecessary(record, origin, opposite)
        })
        .map(|(id, _)| id)
        .collect();

    for id in &doomed {
        if let Some(record) = store.remove(*id) {
            trace!(
                location = %record.location,
                kind = %record.kind(),
                path = %record.primary_path(),
                "Unnecessary change dropped"
            );
        }
    }
    Ok(doomed.len())
}

// ============================================================================
// Stage 4: folder-move pruning
// ============================================================================

fn with_op(record: &ChangeRecord, op: ChangeOp) -> ChangeRecord {
    let mut rewritten = record.clone();
    rewritten.node.path = op.primary_path().clone();
    rewritten.op = op;
    rewritten
}

/// Folds changes below a deleted or moved directory into that change
///
/// Per location, ancestors are visited shallowest first:
/// - below a deleted directory `S`, descendant deletes and moves that stay
///   inside `S` are dropped, as are older creates and edits inside `S`
/// - below a moved directory `S → T`, a descendant move onto the path the
///   ancestor move implies is dropped; other descendant deletes and moves,
///   and older file creates and edits, are rewritten under `T`
///
/// A move into its own subtree is never treated as an ancestor.
pub fn prune_folder_moves(store: &mut ChangeStore) -> usize {
    let mut touched = 0;
    for location in [Location::Local, Location::Remote] {
        let mut ancestors: Vec<(usize, u64, RecordId)> = store
            .iter()
            .filter(|(_, record)| {
                record.location == location
                    && matches!(record.kind(), ChangeKind::Delete | ChangeKind::Path)
            })
            .filter_map(|(id, record)| {
                record
                    .source()
                    .map(|source| (source.depth(), record.sequence, id))
            })
            .collect();
        ancestors.sort_unstable();

        for (_, _, ancestor_id) in ancestors {
            let Some(ancestor) = store.get(ancestor_id).cloned() else {
                continue;
            };
            touched += match &ancestor.op {
                ChangeOp::Delete { source } if !source.is_root() => {
                    prune_under_delete(store, ancestor_id, &ancestor, source)
                }
                ChangeOp::Path { source, target }
                    if !source.is_root() && !target.is_within(source) =>
                {
                    rebase_under_move(store, ancestor_id, &ancestor, source, target)
                }
                _ => 0,
            };
        }
    }
    touched
}

fn descendants_of(
    store: &ChangeStore,
    ancestor_id: RecordId,
    location: Location,
) -> Vec<(RecordId, ChangeRecord)> {
    store
        .iter()
        .filter(|(id, record)| *id != ancestor_id && record.location == location)
        .map(|(id, record)| (id, record.clone()))
        .collect()
}

fn prune_under_delete(
    store: &mut ChangeStore,
    ancestor_id: RecordId,
    ancestor: &ChangeRecord,
    dir: &NodePath,
) -> usize {
    let mut removed = 0;
    for (id, record) in descendants_of(store, ancestor_id, ancestor.location) {
        let covered = match &record.op {
            ChangeOp::Delete { source } => source.is_strict_descendant_of(dir),
            ChangeOp::Path { source, target } => {
                source.is_strict_descendant_of(dir) && target.is_within(dir)
            }
            ChangeOp::Create { target } | ChangeOp::Content { path: target } => {
                target.is_strict_descendant_of(dir) && record.sequence < ancestor.sequence
            }
        };
        if covered {
            trace!(path = %record.primary_path(), ancestor = %dir, "Covered by directory delete");
            store.remove(id);
            removed += 1;
        }
    }
    removed
}

fn rebase_under_move(
    store: &mut ChangeStore,
    ancestor_id: RecordId,
    ancestor: &ChangeRecord,
    from: &NodePath,
    to: &NodePath,
) -> usize {
    let mut touched = 0;
    for (id, record) in descendants_of(store, ancestor_id, ancestor.location) {
        let rewrite = match &record.op {
            ChangeOp::Delete { source } => source
                .rebase(from, to)
                .filter(|_| source.is_strict_descendant_of(from))
                .map(|source| Some(ChangeOp::Delete { source })),
            ChangeOp::Path { source, target } if source.is_strict_descendant_of(from) => {
                source.rebase(from, to).map(|implied| {
                    if target.same_node(&implied) {
                        return None;
                    }
                    let target = if target.is_strict_descendant_of(from) {
                        target.rebase(from, to).unwrap_or_else(|| target.clone())
                    } else {
                        target.clone()
                    };
                    ChangeOp::path(implied, target).ok()
                })
            }
            ChangeOp::Create { target }
                if !record.is_dir()
                    && target.is_strict_descendant_of(from)
                    && record.sequence < ancestor.sequence =>
            {
                target
                    .rebase(from, to)
                    .map(|target| Some(ChangeOp::Create { target }))
            }
            ChangeOp::Content { path }
                if path.is_strict_descendant_of(from) && record.sequence < ancestor.sequence =>
            {
                path.rebase(from, to)
                    .map(|path| Some(ChangeOp::Content { path }))
            }
            _ => None,
        };

        match rewrite {
            Some(Some(op)) => {
                trace!(path = %record.primary_path(), moved_to = %op.primary_path(), "Rebased under directory move");
                store.replace(id, with_op(&record, op));
                touched += 1;
            }
            Some(None) => {
                trace!(path = %record.primary_path(), ancestor = %from, "Implied by directory move");
                store.remove(id);
                touched += 1;
            }
            None => {}
        }
    }
    touched
}
