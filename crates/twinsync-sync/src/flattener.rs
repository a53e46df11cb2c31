//! Change log flattening
//!
//! A change feed reports every raw event of every entity, grouped by entity
//! and ordered by sequence inside a group. The [`Flattener`] folds each
//! group into its net effect: zero, one or two [`ChangeRecord`]s.
//!
//! ## Model
//!
//! Per entity the flattener keeps the path the entity had before its first
//! event (the *anchor*, NULL for a creation) and the composed [`PathDelta`]
//! of all its events. NULL takes part in the arithmetic as the root, so a
//! deletion is a move to the root and a creation a move from it. When the
//! group ends the target is the anchor moved by the delta, with the root
//! mapped back to NULL.
//!
//! The kind of the net change is folded from the raw kinds:
//!
//! | incoming  | current            | result                         |
//! |-----------|--------------------|--------------------------------|
//! | `delete`  | any                | delete                         |
//! | `create`  | any                | create                         |
//! | `content` | create / delete    | create                         |
//! | `content` | path / edit-move   | edit-move                      |
//! | `content` | none / content     | content                        |
//! | `path`    | create / delete    | create (NULL anchor) or path   |
//! | `path`    | content / edit-move| edit-move                      |
//! | `path`    | none / path        | path                           |
//!
//! An edit-move never leaves the flattener as one record: it is split into
//! a delete of the anchor and a create of the target.

use tracing::trace;

use twinsync_core::domain::{
    ChangeOp, ChangeRecord, Location, NodeInfo, NodePath, PathDelta, RawChangeRow, RawKind,
};

/// Net kind folded from an entity's raw events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Folded {
    Create,
    Content,
    Delete,
    Path,
    EditMove,
}

fn fold(current: Option<Folded>, incoming: RawKind, anchored: bool) -> Folded {
    match (incoming, current) {
        (RawKind::Delete, _) => Folded::Delete,
        (RawKind::Create, _) => Folded::Create,
        (RawKind::Content, Some(Folded::Create | Folded::Delete)) => Folded::Create,
        (RawKind::Content, Some(Folded::Path | Folded::EditMove)) => Folded::EditMove,
        (RawKind::Content, _) => Folded::Content,
        (RawKind::Path, Some(Folded::Create | Folded::Delete)) => {
            if anchored {
                Folded::Path
            } else {
                Folded::Create
            }
        }
        (RawKind::Path, Some(Folded::Content | Folded::EditMove)) => Folded::EditMove,
        (RawKind::Path, _) => Folded::Path,
    }
}

/// Accumulated state of the entity currently being read
#[derive(Debug)]
struct EntityState {
    entity_id: String,
    anchor: Option<NodePath>,
    delta: PathDelta,
    kind: Folded,
    content_modified: bool,
    first_seq: u64,
    last_seq: u64,
    node: NodeInfo,
}

impl EntityState {
    fn start(row: RawChangeRow) -> Self {
        let anchor = match row.kind {
            RawKind::Create => None,
            _ => row.source.clone(),
        };
        let mut state = Self {
            entity_id: row.entity_id.clone(),
            anchor,
            delta: PathDelta::identity(),
            kind: fold(None, row.kind, false),
            content_modified: false,
            first_seq: row.seq,
            last_seq: row.seq,
            node: row.node.clone(),
        };
        state.absorb_delta(&row);
        state.content_modified = matches!(row.kind, RawKind::Content | RawKind::Create);
        state
    }

    fn absorb(&mut self, row: RawChangeRow) {
        self.kind = fold(Some(self.kind), row.kind, self.anchor.is_some());
        self.absorb_delta(&row);
        self.content_modified |= matches!(row.kind, RawKind::Content | RawKind::Create);
        self.first_seq = self.first_seq.min(row.seq);
        self.last_seq = self.last_seq.max(row.seq);
        self.node = row.node;
    }

    fn absorb_delta(&mut self, row: &RawChangeRow) {
        let root = NodePath::root();
        let from = row.source.as_ref().unwrap_or(&root);
        let to = row.target.as_ref().unwrap_or(&root);
        self.delta = self.delta.then(&PathDelta::between(from, to));
    }

    fn resolved_target(&self) -> Option<NodePath> {
        let base = self.anchor.clone().unwrap_or_else(NodePath::root);
        let target = self.delta.apply(&base);
        (!target.is_root()).then_some(target)
    }

    /// Reformats the accumulated group into its net records
    fn finish(self, location: Location) -> Vec<ChangeRecord> {
        let target = self.resolved_target();
        let anchor = self.anchor.clone();

        let ops: Vec<ChangeOp> = match self.kind {
            Folded::Delete => anchor
                .map(|source| vec![ChangeOp::Delete { source }])
                .unwrap_or_default(),
            Folded::Create => match (anchor, target) {
                (_, None) => Vec::new(),
                (Some(source), Some(target)) if !source.same_node(&target) => vec![
                    ChangeOp::Delete { source },
                    ChangeOp::Create { target },
                ],
                (_, Some(target)) => vec![ChangeOp::Create { target }],
            },
            Folded::Content => target
                .map(|path| vec![ChangeOp::Content { path }])
                .unwrap_or_default(),
            Folded::Path => match (anchor, target) {
                (_, None) => Vec::new(),
                (None, Some(target)) => vec![ChangeOp::Create { target }],
                (Some(source), Some(target)) if source.same_node(&target) => {
                    if self.content_modified {
                        vec![ChangeOp::Content { path: target }]
                    } else {
                        Vec::new()
                    }
                }
                (Some(source), Some(target)) => vec![ChangeOp::Path { source, target }],
            },
            Folded::EditMove => match (anchor, target) {
                (_, None) => Vec::new(),
                (None, Some(target)) => vec![ChangeOp::Create { target }],
                (Some(source), Some(target)) if source.same_node(&target) => {
                    vec![ChangeOp::Content { path: target }]
                }
                (Some(source), Some(target)) => vec![
                    ChangeOp::Delete { source },
                    ChangeOp::Create { target },
                ],
            },
        };

        trace!(
            entity = %self.entity_id,
            kind = ?self.kind,
            records = ops.len(),
            "Entity flattened"
        );

        ops.into_iter()
            .map(|op| {
                let mut node = self.node.clone();
                node.path = op.primary_path().clone();
                let content_modified = match &op {
                    ChangeOp::Content { .. } => true,
                    ChangeOp::Create { .. } => self.content_modified || !node.is_dir(),
                    ChangeOp::Path { .. } => self.content_modified,
                    ChangeOp::Delete { .. } => false,
                };
                ChangeRecord {
                    location,
                    sequence: self.last_seq,
                    first_sequence: self.first_seq,
                    op,
                    content_modified,
                    node,
                }
            })
            .collect()
    }
}

/// Streaming flattener for one location's feed
///
/// Rows are pushed in feed order; records for an entity are produced as soon
/// as the next entity's first row arrives, and by [`Flattener::finish`] for
/// the last one.
#[derive(Debug)]
pub struct Flattener {
    location: Location,
    current: Option<EntityState>,
    max_seq: Option<u64>,
    rows_seen: u64,
}

impl Flattener {
    pub fn new(location: Location) -> Self {
        Self {
            location,
            current: None,
            max_seq: None,
            rows_seen: 0,
        }
    }

    /// Feeds one raw row, returning the records of a completed entity
    pub fn push(&mut self, row: RawChangeRow) -> Vec<ChangeRecord> {
        self.max_seq = Some(self.max_seq.map_or(row.seq, |max| max.max(row.seq)));
        self.rows_seen += 1;

        if row.source.is_none() && row.target.is_none() {
            trace!(seq = row.seq, entity = %row.entity_id, "Ignoring row without paths");
            return Vec::new();
        }

        match self.current.as_mut() {
            Some(state) if state.entity_id == row.entity_id => {
                state.absorb(row);
                Vec::new()
            }
            _ => {
                let finished = self.current.replace(EntityState::start(row));
                finished
                    .map(|state| state.finish(self.location))
                    .unwrap_or_default()
            }
        }
    }

    /// Flushes the last entity
    pub fn finish(&mut self) -> Vec<ChangeRecord> {
        self.current
            .take()
            .map(|state| state.finish(self.location))
            .unwrap_or_default()
    }

    /// Highest sequence seen so far, including ignored rows
    pub fn max_seq(&self) -> Option<u64> {
        self.max_seq
    }

    pub fn rows_seen(&self) -> u64 {
        self.rows_seen
    }
}

/// Flattens a complete, already grouped row list
pub fn flatten_all(
    location: Location,
    rows: impl IntoIterator<Item = RawChangeRow>,
) -> Vec<ChangeRecord> {
    let mut flattener = Flattener::new(location);
    let mut records: Vec<ChangeRecord> = rows
        .into_iter()
        .flat_map(|row| flattener.push(row))
        .collect();
    records.extend(flattener.finish());
    records
}
