//! The per-cycle Change Store
//!
//! Owns every [`ChangeRecord`] of one cycle, from both locations. Records
//! get a [`RecordId`] on insertion; ids increase with insertion order and
//! are never reused within a store.
//!
//! Two secondary indexes keep the reduction stages O(1) amortized:
//! - `(location, source, target)` over platform-folded [`PathKey`]s
//! - `target`, across both locations

use std::collections::{BTreeMap, BTreeSet, HashMap};

use twinsync_core::domain::{ChangeKind, ChangeRecord, Location, NodePath, PathKey};

/// Identifier of a record inside one [`ChangeStore`]
pub type RecordId = u64;

type TripleKey = (Location, Option<PathKey>, Option<PathKey>);

fn triple_of(record: &ChangeRecord) -> TripleKey {
    (
        record.location,
        record.source().map(NodePath::key),
        record.target().map(NodePath::key),
    )
}

/// Indexed working set of semantic changes
#[derive(Debug, Default)]
pub struct ChangeStore {
    next_id: RecordId,
    records: BTreeMap<RecordId, ChangeRecord>,
    by_triple: HashMap<TripleKey, BTreeSet<RecordId>>,
    by_target: HashMap<PathKey, BTreeSet<RecordId>>,
}

impl ChangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Adds a record and returns its id
    pub fn insert(&mut self, record: ChangeRecord) -> RecordId {
        self.next_id += 1;
        let id = self.next_id;
        self.index(id, &record);
        self.records.insert(id, record);
        id
    }

    pub fn get(&self, id: RecordId) -> Option<&ChangeRecord> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.records.contains_key(&id)
    }

    /// Removes a record, returning it if it was present
    pub fn remove(&mut self, id: RecordId) -> Option<ChangeRecord> {
        let record = self.records.remove(&id)?;
        self.unindex(id, &record);
        Some(record)
    }

    /// Replaces a record in place, keeping its id
    pub fn replace(&mut self, id: RecordId, record: ChangeRecord) -> Option<ChangeRecord> {
        let old = self.records.remove(&id)?;
        self.unindex(id, &old);
        self.index(id, &record);
        self.records.insert(id, record);
        Some(old)
    }

    /// Removes every record the predicate rejects; returns how many went
    pub fn retain(&mut self, mut keep: impl FnMut(&ChangeRecord) -> bool) -> usize {
        let doomed: Vec<RecordId> = self
            .records
            .iter()
            .filter(|(_, record)| !keep(record))
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            self.remove(*id);
        }
        doomed.len()
    }

    /// Records in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (RecordId, &ChangeRecord)> {
        self.records.iter().map(|(id, record)| (*id, record))
    }

    pub fn ids(&self) -> Vec<RecordId> {
        self.records.keys().copied().collect()
    }

    /// Ids of the records of `location` with exactly this source and target
    pub fn ids_with_triple(
        &self,
        location: Location,
        source: Option<&NodePath>,
        target: Option<&NodePath>,
    ) -> Vec<RecordId> {
        let key = (location, source.map(NodePath::key), target.map(NodePath::key));
        self.by_triple
            .get(&key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Ids of the records, from either location, whose target is `path`
    pub fn ids_targeting(&self, path: &NodePath) -> Vec<RecordId> {
        self.by_target
            .get(&path.key())
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Lowest first sequence among the pending records of `location`
    pub fn min_pending_sequence(&self, location: Location) -> Option<u64> {
        self.records
            .values()
            .filter(|record| record.location == location)
            .map(|record| record.first_sequence)
            .min()
    }

    pub fn count_for(&self, location: Location) -> usize {
        self.records
            .values()
            .filter(|record| record.location == location)
            .count()
    }

    /// Bytes still to transfer for the pending file creates and edits
    pub fn queued_bytes(&self) -> u64 {
        self.records
            .values()
            .filter(|record| {
                !record.is_dir() && matches!(record.kind(), ChangeKind::Create | ChangeKind::Content)
            })
            .map(|record| record.node.byte_size)
            .sum()
    }

    /// A page of the pending records for the control surface, by sequence
    pub fn page(&self, offset: usize, limit: usize) -> Vec<ChangeRecord> {
        let mut all: Vec<&ChangeRecord> = self.records.values().collect();
        all.sort_by_key(|record| (record.sequence, record.location));
        all.into_iter().skip(offset).take(limit).cloned().collect()
    }

    fn index(&mut self, id: RecordId, record: &ChangeRecord) {
        self.by_triple.entry(triple_of(record)).or_default().insert(id);
        if let Some(target) = record.target() {
            self.by_target.entry(target.key()).or_default().insert(id);
        }
    }

    fn unindex(&mut self, id: RecordId, record: &ChangeRecord) {
        let triple = triple_of(record);
        if let Some(ids) = self.by_triple.get_mut(&triple) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_triple.remove(&triple);
            }
        }
        if let Some(target) = record.target() {
            let key = target.key();
            if let Some(ids) = self.by_target.get_mut(&key) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_target.remove(&key);
                }
            }
        }
    }
}
