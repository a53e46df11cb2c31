//! Concurrent change applier
//!
//! Drains the reduced Change Store in three phases:
//!
//! 1. directory creates, sorted by target, in bulk `mkdirs` batches
//! 2. remaining directory records (deletes, moves), one at a time
//! 3. everything else by sequence, through a bounded worker pool; records
//!    sharing a source or target path never run at the same time, and run
//!    in sequence order
//!
//! Every settled record is removed from the store and the watermarks are
//! recomputed and persisted right away, so a crash at any point replays at
//! most the records still pending. A record that fails is attempted once
//! per cycle; later phases leave it alone.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use tracing::{debug, error, info, instrument, warn};

use twinsync_core::config::JobConfig;
use twinsync_core::domain::{
    ChangeKind, ChangeRecord, ErrorClass, FailureEntry, Location, NodePath, NodeStatus, PathKey,
    Watermarks,
};
use twinsync_core::ports::{AdapterError, IStateRepository};

use crate::control::{JobControl, ProgressEvent};
use crate::processor::{ChangeProcessor, Outcome};
use crate::store::{ChangeStore, RecordId};
use crate::SyncError;

/// Watermarks to persist for the current store contents
///
/// Each location resumes from its lowest pending first sequence, or from the
/// cycle's upper bound when nothing of it is pending.
pub fn checkpoint(store: &ChangeStore, bounds: &Watermarks) -> Watermarks {
    let mut marks = Watermarks::default();
    for location in [Location::Local, Location::Remote] {
        let mark = store
            .min_pending_sequence(location)
            .unwrap_or_else(|| bounds.get(location));
        marks.set(location, mark);
    }
    marks
}

/// Status a node carries while its change is in flight
fn transfer_status(origin: Location) -> NodeStatus {
    match origin.opposite() {
        Location::Remote => NodeStatus::Up,
        Location::Local => NodeStatus::Down,
    }
}

/// Counters of one apply phase run
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: usize,
    pub failed: usize,
    pub skipped: usize,
    /// The fatal error that stopped the run early
    pub aborted: Option<AdapterError>,
    pub interrupted: bool,
    /// Records that failed during this run and wait for the next cycle
    held: HashSet<RecordId>,
}

impl ApplyReport {
    pub fn processed(&self) -> usize {
        self.applied + self.failed + self.skipped
    }

    fn stopped(&self) -> bool {
        self.aborted.is_some() || self.interrupted
    }
}

/// Worker pacing: a fixed delay plus a random jitter
#[derive(Debug, Clone, Copy)]
struct Pacing {
    base_ms: u64,
    jitter_ms: u64,
}

impl Pacing {
    fn delay(&self) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        Duration::from_millis(self.base_ms + jitter)
    }
}

/// Applies the records of one cycle
pub struct ChangeApplier {
    processor: ChangeProcessor,
    repository: Arc<dyn IStateRepository>,
    control: JobControl,
    job_id: String,
    pool_size: usize,
    mkdir_batch_size: usize,
    pacing: Pacing,
}

impl ChangeApplier {
    pub fn new(
        processor: ChangeProcessor,
        repository: Arc<dyn IStateRepository>,
        control: JobControl,
        job: &JobConfig,
    ) -> Self {
        Self {
            processor,
            repository,
            control,
            job_id: job.id.clone(),
            pool_size: job.pool_size.max(1),
            mkdir_batch_size: job.mkdir_batch_size.max(1),
            pacing: Pacing {
                base_ms: job.pacing_ms,
                jitter_ms: job.pacing_jitter_ms,
            },
        }
    }

    /// Applies every record in `store`
    ///
    /// Records that fail recoverably stay in the store. A fatal error or an
    /// interrupt stops the run with the remaining records still pending.
    ///
    /// # Errors
    /// Only state repository failures are returned as errors; adapter
    /// failures are classified into the report.
    #[instrument(skip_all, fields(job = %self.job_id, records = store.len()))]
    pub async fn apply(
        &self,
        store: &mut ChangeStore,
        bounds: &Watermarks,
    ) -> Result<ApplyReport, SyncError> {
        let mut report = ApplyReport::default();
        self.control.update_progress(|progress| {
            progress.queue_length = store.len();
            progress.queue_done = 0;
            progress.queue_bytes = store.queued_bytes();
        });

        self.apply_directory_creates(store, bounds, &mut report).await?;
        if !report.stopped() {
            self.apply_directory_changes(store, bounds, &mut report).await?;
        }
        if !report.stopped() {
            self.apply_files(store, bounds, &mut report).await?;
        }

        if let Some(err) = &report.aborted {
            error!(error = %err, pending = store.len(), "Apply phase aborted");
        }
        info!(
            applied = report.applied,
            failed = report.failed,
            skipped = report.skipped,
            pending = store.len(),
            interrupted = report.interrupted,
            "Apply phase finished"
        );
        Ok(report)
    }

    // ========================================================================
    // Phase 1: directory creates
    // ========================================================================

    async fn apply_directory_creates(
        &self,
        store: &mut ChangeStore,
        bounds: &Watermarks,
        report: &mut ApplyReport,
    ) -> Result<(), SyncError> {
        let mut creates: Vec<(RecordId, ChangeRecord)> = store
            .iter()
            .filter(|(_, record)| record.is_dir() && record.kind() == ChangeKind::Create)
            .map(|(id, record)| (id, record.clone()))
            .collect();
        if creates.is_empty() {
            return Ok(());
        }
        creates.sort_by(|(_, a), (_, b)| a.primary_path().cmp(b.primary_path()));
        debug!(count = creates.len(), "Phase 1: directory creates");

        for origin in [Location::Local, Location::Remote] {
            let group: Vec<(RecordId, ChangeRecord)> = creates
                .iter()
                .filter(|(_, record)| record.location == origin)
                .cloned()
                .collect();
            if group.is_empty() {
                continue;
            }
            if !self.processor.permits(origin) {
                for (id, _) in &group {
                    store.remove(*id);
                    report.skipped += 1;
                }
                self.persist_marks(store, bounds).await?;
                continue;
            }

            for batch in group.chunks(self.mkdir_batch_size) {
                if self.control.is_interrupted() {
                    report.interrupted = true;
                    return Ok(());
                }
                self.apply_mkdir_batch(store, bounds, origin, batch, report)
                    .await?;
                if report.stopped() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn apply_mkdir_batch(
        &self,
        store: &mut ChangeStore,
        bounds: &Watermarks,
        origin: Location,
        batch: &[(RecordId, ChangeRecord)],
        report: &mut ApplyReport,
    ) -> Result<(), SyncError> {
        let paths: Vec<NodePath> = batch
            .iter()
            .map(|(_, record)| record.primary_path().clone())
            .collect();
        self.repository
            .set_statuses(&self.job_id, &paths, transfer_status(origin))
            .await?;

        match self.processor.mkdirs(origin.opposite(), &paths).await {
            Ok(echoes) => {
                for echo in &echoes {
                    self.repository.push_echo(&self.job_id, echo).await?;
                }
                self.repository
                    .set_statuses(&self.job_id, &paths, NodeStatus::Idle)
                    .await?;
                for (id, record) in batch {
                    store.remove(*id);
                    self.note_applied(record);
                }
                report.applied += batch.len();
                self.persist_marks(store, bounds).await?;
                Ok(())
            }
            Err(err) if err.class() == ErrorClass::RecoverablePerRecord => {
                warn!(error = %err, count = batch.len(), "Directory batch failed, retrying one by one");
                for (id, record) in batch {
                    if self.control.is_interrupted() {
                        report.interrupted = true;
                        break;
                    }
                    let result = self.processor.apply(record).await;
                    self.settle(store, bounds, *id, record, result, report)
                        .await?;
                    if report.stopped() {
                        break;
                    }
                }
                Ok(())
            }
            Err(err) => {
                self.settle_batch_failure(batch, err, report).await?;
                Ok(())
            }
        }
    }

    async fn settle_batch_failure(
        &self,
        batch: &[(RecordId, ChangeRecord)],
        err: AdapterError,
        report: &mut ApplyReport,
    ) -> Result<(), SyncError> {
        if let Some((_, first)) = batch.first() {
            self.record_failure(first, &err).await?;
        }
        match err.class() {
            ErrorClass::UserRequested => report.interrupted = true,
            _ => report.aborted = Some(err),
        }
        Ok(())
    }

    // ========================================================================
    // Phase 2: directory deletes and moves
    // ========================================================================

    async fn apply_directory_changes(
        &self,
        store: &mut ChangeStore,
        bounds: &Watermarks,
        report: &mut ApplyReport,
    ) -> Result<(), SyncError> {
        let records: Vec<(RecordId, ChangeRecord)> = store
            .iter()
            .filter(|(id, record)| record.is_dir() && !report.held.contains(id))
            .map(|(id, record)| (id, record.clone()))
            .collect();
        if records.is_empty() {
            return Ok(());
        }
        debug!(count = records.len(), "Phase 2: directory changes");

        for (id, record) in order_directory_changes(records) {
            if self.control.is_interrupted() {
                report.interrupted = true;
                return Ok(());
            }
            if self.processor.permits(record.location) {
                self.mark_in_flight(&record).await?;
            }
            let result = self.processor.apply(&record).await;
            self.settle(store, bounds, id, &record, result, report)
                .await?;
            if report.stopped() {
                return Ok(());
            }
        }
        Ok(())
    }

    // ========================================================================
    // Phase 3: files, through the worker pool
    // ========================================================================

    async fn apply_files(
        &self,
        store: &mut ChangeStore,
        bounds: &Watermarks,
        report: &mut ApplyReport,
    ) -> Result<(), SyncError> {
        let mut queue: Vec<(RecordId, ChangeRecord)> = store
            .iter()
            .filter(|(id, _)| !report.held.contains(id))
            .map(|(id, record)| (id, record.clone()))
            .collect();
        if queue.is_empty() {
            return Ok(());
        }
        queue.sort_by_key(|(id, record)| (record.sequence, *id));
        debug!(count = queue.len(), pool = self.pool_size, "Phase 3: file changes");

        let mut waiting: VecDeque<(RecordId, ChangeRecord)> = queue.into();
        let mut busy: HashSet<PathKey> = HashSet::new();
        let mut workers = FuturesUnordered::new();

        loop {
            if !report.stopped() && !self.control.is_interrupted() {
                let mut blocked: HashSet<PathKey> = HashSet::new();
                let mut index = 0;
                while workers.len() < self.pool_size && index < waiting.len() {
                    let keys = lane_keys(&waiting[index].1);
                    if keys
                        .iter()
                        .any(|key| busy.contains(key) || blocked.contains(key))
                    {
                        // Later records on these paths queue up behind it
                        blocked.extend(keys);
                        index += 1;
                        continue;
                    }
                    if let Some((id, record)) = waiting.remove(index) {
                        busy.extend(keys);
                        workers.push(self.work(id, record));
                    }
                }
            }

            let Some((id, record, result)) = workers.next().await else {
                break;
            };
            for key in lane_keys(&record) {
                busy.remove(&key);
            }
            let result = match result {
                Ok(outcome) => Ok(outcome),
                Err(SyncError::Adapter(err)) => Err(err),
                Err(other) => return Err(other),
            };
            self.settle(store, bounds, id, &record, result, report)
                .await?;
        }

        if self.control.is_interrupted() && !waiting.is_empty() {
            debug!(unstarted = waiting.len(), "Interrupted with records left");
            report.interrupted = true;
        }
        Ok(())
    }

    /// One worker run: status, adapter call, pacing
    async fn work(
        &self,
        id: RecordId,
        record: ChangeRecord,
    ) -> (RecordId, ChangeRecord, Result<Outcome, SyncError>) {
        if self.processor.permits(record.location) {
            if let Err(e) = self.mark_in_flight(&record).await {
                return (id, record, Err(e));
            }
        }
        let result = self.processor.apply(&record).await;
        if matches!(result, Ok(Outcome::Applied(_))) {
            tokio::time::sleep(self.pacing.delay()).await;
        }
        (id, record, result.map_err(SyncError::from))
    }

    // ========================================================================
    // Settling results
    // ========================================================================

    async fn settle(
        &self,
        store: &mut ChangeStore,
        bounds: &Watermarks,
        id: RecordId,
        record: &ChangeRecord,
        result: Result<Outcome, AdapterError>,
        report: &mut ApplyReport,
    ) -> Result<(), SyncError> {
        match result {
            Ok(Outcome::Applied(echo)) => {
                self.repository.push_echo(&self.job_id, &echo).await?;
                self.repository
                    .set_status(&self.job_id, record.primary_path(), NodeStatus::Idle)
                    .await?;
                store.remove(id);
                report.applied += 1;
                self.note_applied(record);
                self.persist_marks(store, bounds).await?;
            }
            Ok(Outcome::Skipped) => {
                store.remove(id);
                report.skipped += 1;
                self.control
                    .update_progress(|progress| progress.queue_done += 1);
                self.persist_marks(store, bounds).await?;
            }
            Err(err) => {
                match err.class() {
                    ErrorClass::RecoverablePerRecord => {
                        warn!(
                            location = %record.location,
                            seq = record.sequence,
                            kind = %record.kind(),
                            path = %record.primary_path(),
                            error = %err,
                            "Change failed, will retry next cycle"
                        );
                        report.failed += 1;
                    }
                    ErrorClass::UserRequested => {
                        report.interrupted = true;
                    }
                    ErrorClass::FatalPerCycle | ErrorClass::FatalPerConnection => {
                        if report.aborted.is_none() {
                            report.aborted = Some(err.clone());
                        }
                    }
                }
                report.held.insert(id);
                self.repository
                    .set_status(&self.job_id, record.primary_path(), NodeStatus::Pending)
                    .await?;
                if err.class() != ErrorClass::UserRequested {
                    self.record_failure(record, &err).await?;
                }
            }
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        record: &ChangeRecord,
        err: &AdapterError,
    ) -> Result<(), SyncError> {
        let entry = FailureEntry::for_record(&self.job_id, record, err.class(), err.to_string());
        self.repository.record_failure(&entry).await?;
        self.control.publish(ProgressEvent::Failed {
            path: record.primary_path().clone(),
            message: err.to_string(),
        });
        self.control
            .update_progress(|progress| progress.last_error = Some(err.to_string()));
        Ok(())
    }

    async fn mark_in_flight(&self, record: &ChangeRecord) -> Result<(), SyncError> {
        self.repository
            .set_status(&self.job_id, record.primary_path(), transfer_status(record.location))
            .await?;
        Ok(())
    }

    fn note_applied(&self, record: &ChangeRecord) {
        self.control.update_progress(|progress| {
            progress.queue_done += 1;
            if !record.is_dir() && record.kind() != ChangeKind::Delete {
                progress.queue_bytes = progress.queue_bytes.saturating_sub(record.node.byte_size);
            }
        });
        self.control.publish(ProgressEvent::Applied {
            location: record.location,
            kind: record.kind(),
            path: record.primary_path().clone(),
        });
    }

    async fn persist_marks(
        &self,
        store: &ChangeStore,
        bounds: &Watermarks,
    ) -> Result<(), SyncError> {
        let marks = checkpoint(store, bounds);
        self.repository
            .save_watermarks(&self.job_id, &marks)
            .await?;
        Ok(())
    }
}

/// Paths a record touches; records sharing one are applied one at a time
fn lane_keys(record: &ChangeRecord) -> Vec<PathKey> {
    let mut keys: Vec<PathKey> = record
        .source()
        .into_iter()
        .chain(record.target())
        .map(NodePath::key)
        .collect();
    keys.dedup();
    keys
}

/// Orders directory deletes and moves
///
/// Lexicographic by source, except that a record whose source lies inside
/// the target of another move in the same set runs after that move: its
/// path was rebased onto the moved tree and only exists once the move ran.
fn order_directory_changes(
    records: Vec<(RecordId, ChangeRecord)>,
) -> Vec<(RecordId, ChangeRecord)> {
    let move_targets: Vec<(RecordId, NodePath)> = records
        .iter()
        .filter(|(_, record)| record.kind() == ChangeKind::Path)
        .filter_map(|(id, record)| record.target().map(|target| (*id, target.clone())))
        .collect();

    let mut ranked: Vec<(usize, RecordId, ChangeRecord)> = records
        .into_iter()
        .map(|(id, record)| {
            let rank = move_targets
                .iter()
                .filter(|(other, target)| {
                    *other != id
                        && record
                            .source()
                            .is_some_and(|source| source.is_within(target))
                })
                .count();
            (rank, id, record)
        })
        .collect();
    let source = |record: &ChangeRecord| record.source().unwrap_or(record.primary_path()).clone();
    ranked.sort_by(|(rank_a, id_a, a), (rank_b, id_b, b)| {
        rank_a
            .cmp(rank_b)
            .then_with(|| source(a).cmp(&source(b)))
            .then_with(|| id_a.cmp(id_b))
    });
    ranked
        .into_iter()
        .map(|(_, id, record)| (id, record))
        .collect()
}
