//! Sync cycle orchestrator
//!
//! The [`SyncEngine`] runs one job: a loop of cycles separated by online or
//! offline sleeps. One cycle goes through
//!
//! ```text
//! FETCHING → REDUCING → CONFLICT_CHECK → APPLYING → CHECKPOINTING
//! ```
//!
//! 1. **Fetch**: stream both feeds from their watermarks through the
//!    flattener, the path filter and the echo filter into a fresh store
//! 2. **Reduce**: run the reduction pipeline
//! 3. **Conflict check**: consume stored resolutions, detect divergence; any
//!    open conflict skips the apply phase entirely
//! 4. **Apply**: hand the store to the [`ChangeApplier`]
//! 5. **Checkpoint**: persist both watermarks
//!
//! Echoes suppressed during the fetch are bound to the feed sequence they
//! matched. Once the cycle ends, unbound echoes from the fetched listing are
//! dropped, and bound ones go as soon as their location's watermark passes
//! the change they matched.
//!
//! Keep-both resolutions move the local file aside only after the gate is
//! clear, so a cycle blocked by other conflicts leaves the replica untouched.
//!
//! Connection failures end the cycle offline without touching watermarks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveTime};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use twinsync_conflict::policy::validate_rule;
use twinsync_conflict::{
    ConflictDetector, ConflictError, ConflictResolver, DetectedConflict, KeepBothAction,
    PolicyEngine, ResolutionPlan,
};
use twinsync_core::config::{
    parse_start_time, Config, Direction, Frequency, JobConfig, UnnecessaryChangePolicy,
};
use twinsync_core::domain::{
    ChangeKind, ChangeOp, ChangeRecord, ConflictRecord, EchoRecord, ErrorClass, Location,
    NodePath, NodeStatus, Watermarks,
};
use twinsync_core::ports::{
    AdapterError, ILocalEventSource, IRemoteChangeFeed, ISyncAdapter, IStateRepository,
};

use crate::applier::{checkpoint, ChangeApplier};
use crate::control::{CycleSummary, JobControl, JobState, ProgressEvent, SleepMode};
use crate::filter::{EchoFilter, PathFilter};
use crate::flattener::Flattener;
use crate::processor::ChangeProcessor;
use crate::reduce::run_pipeline;
use crate::store::ChangeStore;
use crate::SyncError;

/// Rows buffered between a feed and the flattener
const FEED_BUFFER: usize = 256;

/// First step of the write-burst wait
const BURST_STEP_INITIAL: Duration = Duration::from_millis(500);

/// Longest single step of the write-burst wait
const BURST_STEP_MAX: Duration = Duration::from_secs(5);

/// Resolution/scan passes per conflict check
const RESOLUTION_PASSES: usize = 2;

// ============================================================================
// Ports and outcomes
// ============================================================================

/// Everything the engine talks to
#[derive(Clone)]
pub struct EnginePorts {
    pub local: Arc<dyn ISyncAdapter>,
    pub remote: Arc<dyn ISyncAdapter>,
    pub local_events: Arc<dyn ILocalEventSource>,
    pub remote_feed: Arc<dyn IRemoteChangeFeed>,
    pub repository: Arc<dyn IStateRepository>,
}

/// How one cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Checkpoint written; there may still be records that failed recoverably
    Completed(CycleSummary),
    /// The remote side is unreachable; nothing was applied
    Offline(String),
    /// A replica volume is missing
    Waiting(String),
    /// Open conflicts blocked the apply phase
    ConflictsPending(usize),
    /// A fatal per-cycle error stopped the apply phase
    Aborted(String),
    /// Pause or stop requested mid-cycle
    Interrupted,
}

impl CycleOutcome {
    fn sleep_mode(&self) -> Option<SleepMode> {
        match self {
            CycleOutcome::Completed(_) => Some(SleepMode::Online),
            CycleOutcome::Interrupted => None,
            _ => Some(SleepMode::Offline),
        }
    }
}

/// Maps a fetch/reduce adapter failure onto a cycle outcome
fn outcome_for(err: AdapterError) -> Result<CycleOutcome, SyncError> {
    match err.class() {
        ErrorClass::FatalPerConnection => Ok(CycleOutcome::Offline(err.to_string())),
        ErrorClass::UserRequested => Ok(CycleOutcome::Interrupted),
        _ => Err(err.into()),
    }
}

/// True inside the minute that starts at `start` (hour, minute)
pub fn in_start_window(start: (u32, u32), now: NaiveTime) -> bool {
    let Some(begin) = NaiveTime::from_hms_opt(start.0, start.1, 0) else {
        return false;
    };
    let elapsed = now.signed_duration_since(begin);
    elapsed >= chrono::Duration::zero() && elapsed < chrono::Duration::minutes(1)
}

// ============================================================================
// SyncEngine
// ============================================================================

/// Reconciliation loop of one job
pub struct SyncEngine {
    job: JobConfig,
    start_time: Option<(u32, u32)>,
    ports: EnginePorts,
    control: JobControl,
    path_filter: PathFilter,
    policy: PolicyEngine,
    resolver: ConflictResolver,
    applier: ChangeApplier,
    cycles: AtomicU64,
}

impl SyncEngine {
    /// Builds the engine for `config`
    ///
    /// # Errors
    /// Returns `SyncError::InvalidConfig` if the configuration fails
    /// validation, and `SyncError::Conflict` for a malformed conflict rule.
    pub fn new(config: &Config, ports: EnginePorts, control: JobControl) -> Result<Self, SyncError> {
        let errors = config.validate();
        if !errors.is_empty() {
            let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
            return Err(SyncError::InvalidConfig(joined.join("; ")));
        }
        for rule in &config.conflicts.rules {
            validate_rule(rule)?;
        }

        let start_time = match config.job.frequency {
            Frequency::Time => {
                let raw = config.job.start_time.as_deref().unwrap_or_default();
                Some(parse_start_time(raw).ok_or_else(|| {
                    SyncError::InvalidConfig(format!("invalid start time '{raw}'"))
                })?)
            }
            _ => None,
        };

        let processor = ChangeProcessor::new(
            ports.local.clone(),
            ports.remote.clone(),
            config.job.direction,
        );
        let applier = ChangeApplier::new(
            processor,
            ports.repository.clone(),
            control.clone(),
            &config.job,
        );

        Ok(Self {
            job: config.job.clone(),
            start_time,
            path_filter: PathFilter::from_config(&config.filters)?,
            policy: PolicyEngine::new(config.conflicts.default_strategy, &config.conflicts.rules),
            resolver: ConflictResolver::new(ports.local.clone()),
            applier,
            ports,
            control,
            cycles: AtomicU64::new(0),
        })
    }

    pub fn control(&self) -> &JobControl {
        &self.control
    }

    // ========================================================================
    // Job loop
    // ========================================================================

    /// Runs cycles until the job is stopped
    pub async fn run(&self) {
        info!(job = %self.job.id, frequency = ?self.job.frequency, "Job started");
        let mut last_window: Option<NaiveDate> = None;

        while !self.control.is_stopped() {
            if self.control.is_paused() {
                self.control.set_state(JobState::Paused);
                if !self.control.wait_while_paused().await {
                    break;
                }
                continue;
            }

            let forced = self.control.take_run_request();
            match (self.job.frequency, self.start_time) {
                (Frequency::Manual, _) if !forced => {
                    self.control.set_state(JobState::Sleeping(SleepMode::Offline));
                    self.control.sleep(None).await;
                    continue;
                }
                (Frequency::Time, Some(start)) if !forced => {
                    let now = chrono::Local::now();
                    let today = now.date_naive();
                    if !in_start_window(start, now.time()) || last_window == Some(today) {
                        debug!(job = %self.job.id, "Outside the scheduled window");
                        self.sleep(SleepMode::Offline).await;
                        continue;
                    }
                    last_window = Some(today);
                }
                _ => {}
            }

            let mode = match self.run_cycle().await {
                Ok(outcome) => {
                    debug!(job = %self.job.id, ?outcome, "Cycle ended");
                    outcome.sleep_mode()
                }
                Err(err) => {
                    error!(job = %self.job.id, error = %err, "Cycle failed");
                    self.control
                        .update_progress(|progress| progress.last_error = Some(err.to_string()));
                    match err.class() {
                        ErrorClass::UserRequested => None,
                        _ => Some(SleepMode::Offline),
                    }
                }
            };

            match (mode, self.job.frequency) {
                (_, Frequency::Manual) => {
                    self.control.set_state(JobState::Sleeping(SleepMode::Offline));
                    self.control.sleep(None).await;
                }
                (Some(mode), _) => self.sleep(mode).await,
                (None, _) => {}
            }
        }

        self.control.set_state(JobState::Stopped);
        info!(job = %self.job.id, "Job stopped");
    }

    async fn sleep(&self, mode: SleepMode) {
        let seconds = match mode {
            SleepMode::Online => self.job.online_interval_secs,
            SleepMode::Offline => self.job.offline_interval_secs,
        };
        self.control.set_state(JobState::Sleeping(mode));
        self.control.sleep(Some(Duration::from_secs(seconds))).await;
    }

    // ========================================================================
    // One cycle
    // ========================================================================

    /// Runs one full cycle
    ///
    /// # Errors
    /// Returns an error for state repository failures and for adapter
    /// failures that are neither connection losses nor interrupts.
    #[instrument(skip(self), fields(job = %self.job.id))]
    pub async fn run_cycle(&self) -> Result<CycleOutcome, SyncError> {
        let started = Instant::now();
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed);
        let job_id = self.job.id.as_str();
        let repository = &self.ports.repository;
        info!(cycle, "Starting sync cycle");

        // --- Pre-flight ---
        if let Some(reason) = self.check_volumes().await? {
            warn!(%reason, "Replica volume unavailable");
            self.control.set_state(JobState::Waiting);
            self.control
                .update_progress(|progress| progress.last_error = Some(reason.clone()));
            return Ok(CycleOutcome::Waiting(reason));
        }
        self.wait_for_write_burst().await;
        if self.control.is_interrupted() {
            return Ok(CycleOutcome::Interrupted);
        }

        // --- FETCHING ---
        self.control.set_state(JobState::Fetching);
        let marks = repository.load_watermarks(job_id).await?;
        let echo_high_water = repository.echo_high_water(job_id).await?;
        let mut echoes = EchoFilter::new(repository.list_echoes(job_id).await?);
        let mut store = ChangeStore::new();

        let mut bounds = marks;
        if self.job.direction != Direction::Up {
            match self
                .fetch_side(Location::Remote, marks.remote, &mut store, &mut echoes)
                .await
            {
                Ok(bound) => bounds.remote = bound,
                Err(err) => {
                    warn!(error = %err, "Remote fetch failed");
                    self.control.update_progress(|progress| {
                        progress.online = false;
                        progress.last_error = Some(err.to_string());
                    });
                    return outcome_for(err);
                }
            }
        }
        match self
            .fetch_side(Location::Local, marks.local, &mut store, &mut echoes)
            .await
        {
            Ok(bound) => bounds.local = bound,
            Err(err) => return outcome_for(err),
        }
        self.control.update_progress(|progress| progress.online = true);
        repository.bind_echoes(job_id, echoes.bindings()).await?;
        let fetched = store.len();
        info!(
            fetched,
            echoes_suppressed = echoes.suppressed(),
            echoes_unmatched = echoes.unmatched(),
            local_bound = bounds.local,
            remote_bound = bounds.remote,
            "Changes fetched"
        );

        let outcome = self
            .reconcile(&mut store, marks, bounds, fetched, started)
            .await?;

        // Echoes listed for this ingest have served their cycle
        let persisted = repository.load_watermarks(job_id).await?;
        let expired = repository
            .expire_echoes(job_id, echo_high_water, &persisted)
            .await?;
        debug!(expired, "Echoes expired");
        Ok(outcome)
    }

    /// Reduces, gates and applies one ingested change set, then checkpoints
    async fn reconcile(
        &self,
        store: &mut ChangeStore,
        marks: Watermarks,
        bounds: Watermarks,
        fetched: usize,
        started: Instant,
    ) -> Result<CycleOutcome, SyncError> {
        let job_id = self.job.id.as_str();
        let repository = &self.ports.repository;

        // --- REDUCING ---
        self.control.set_state(JobState::Reducing);
        repository.mark_new_as_idle(job_id).await?;
        let check_unnecessary = match self.job.unnecessary_changes {
            UnnecessaryChangePolicy::Always => true,
            UnnecessaryChangePolicy::FirstRunOnly => marks == Watermarks::default(),
            UnnecessaryChangePolicy::Never => false,
        };
        let reduction = match run_pipeline(
            store,
            self.ports.local.as_ref(),
            self.ports.remote.as_ref(),
            check_unnecessary,
        )
        .await
        {
            Ok(report) => report,
            Err(err) => return outcome_for(err),
        };

        // --- CONFLICT_CHECK ---
        let (open, keep_both) = self.check_conflicts(store).await?;
        self.control.update_progress(|progress| progress.conflicts = open);
        if open > 0 {
            warn!(
                conflicts = open,
                deferred_keep_both = keep_both.len(),
                "Conflicts pending, nothing applied"
            );
            return Ok(CycleOutcome::ConflictsPending(open));
        }
        for (action, record) in keep_both {
            self.keep_both(store, &action, record).await?;
        }

        match self.job.direction {
            Direction::Down => {
                let dropped = store.retain(|record| record.location != Location::Local);
                debug!(dropped, "Local changes ignored by direction");
            }
            Direction::Up => {
                store.retain(|record| record.location != Location::Remote);
            }
            Direction::Bi => {}
        }
        let pending: Vec<NodePath> = store
            .iter()
            .map(|(_, record)| record.primary_path().clone())
            .collect();
        repository
            .set_statuses(job_id, &pending, NodeStatus::Pending)
            .await?;

        // --- APPLYING ---
        self.control.set_state(JobState::Applying);
        let report = self.applier.apply(store, &bounds).await?;
        if let Some(err) = report.aborted {
            self.control
                .update_progress(|progress| progress.last_error = Some(err.to_string()));
            return Ok(match err.class() {
                ErrorClass::FatalPerConnection => CycleOutcome::Offline(err.to_string()),
                _ => CycleOutcome::Aborted(err.to_string()),
            });
        }
        if report.interrupted {
            return Ok(CycleOutcome::Interrupted);
        }

        // --- CHECKPOINTING ---
        self.control.set_state(JobState::Checkpointing);
        let next = checkpoint(store, &bounds);
        repository.save_watermarks(job_id, &next).await?;

        let summary = CycleSummary {
            fetched,
            reduced: reduction.total(),
            applied: report.applied,
            failed: report.failed,
            skipped: report.skipped,
            conflicts: 0,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            applied = summary.applied,
            failed = summary.failed,
            skipped = summary.skipped,
            local_mark = next.local,
            remote_mark = next.remote,
            duration_ms = summary.duration_ms,
            "Sync cycle completed"
        );
        self.control.update_progress(|progress| {
            progress.queue_length = store.len();
        });
        self.control.publish(ProgressEvent::CycleCompleted {
            summary: summary.clone(),
        });
        Ok(CycleOutcome::Completed(summary))
    }

    // ========================================================================
    // Pre-flight
    // ========================================================================

    /// Returns a reason when a replica root is unavailable
    async fn check_volumes(&self) -> Result<Option<String>, SyncError> {
        let root = NodePath::root();
        match self.ports.local.stat(&root, false).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Ok(Some(format!(
                    "local folder {} not found",
                    self.job.local_root.display()
                )))
            }
            Err(err) if err.class() == ErrorClass::FatalPerCycle => return Err(err.into()),
            Err(err) => return Ok(Some(err.to_string())),
        }

        match self.ports.remote.stat(&root, false).await {
            Ok(Some(_)) => Ok(None),
            Ok(None) => {
                info!("Remote root missing, creating it");
                match self.ports.remote.mkdir(&root).await {
                    Ok(()) => Ok(None),
                    Err(err) => Ok(Some(format!("remote root missing: {err}"))),
                }
            }
            Err(err) => Ok(Some(err.to_string())),
        }
    }

    /// Gives a running write burst on the local side time to settle
    async fn wait_for_write_burst(&self) {
        let max = Duration::from_secs(self.job.event_wait_max_secs);
        let mut step = BURST_STEP_INITIAL;
        let mut waited = Duration::ZERO;

        while waited < max
            && self.ports.local_events.is_writing()
            && !self.control.is_interrupted()
        {
            let nap = step.min(max - waited);
            debug!(waited_ms = waited.as_millis() as u64, "Local writes in progress, waiting");
            tokio::time::sleep(nap).await;
            waited += nap;
            step = (step * 2).min(BURST_STEP_MAX);
        }
    }

    // ========================================================================
    // Fetching
    // ========================================================================

    /// Streams one feed into `store`; returns the feed's upper bound
    #[instrument(skip(self, store, echoes), fields(location = %location))]
    async fn fetch_side(
        &self,
        location: Location,
        since: u64,
        store: &mut ChangeStore,
        echoes: &mut EchoFilter,
    ) -> Result<u64, AdapterError> {
        let (tx, mut rx) = mpsc::channel(FEED_BUFFER);
        let ports = &self.ports;
        let feed = async move {
            match location {
                Location::Remote => ports.remote_feed.fetch_changes(since, tx).await,
                Location::Local => ports.local_events.read_events(since, tx).await,
            }
        };

        let path_filter = &self.path_filter;
        let drain = async {
            let mut flattener = Flattener::new(location);
            let mut admitted = 0usize;
            let mut admit = |record: ChangeRecord| {
                if path_filter.allows_record(&record) && !echoes.suppress(&record) {
                    store.insert(record);
                    admitted += 1;
                }
            };
            while let Some(row) = rx.recv().await {
                flattener.push(row).into_iter().for_each(&mut admit);
            }
            flattener.finish().into_iter().for_each(&mut admit);
            (admitted, flattener.rows_seen())
        };

        let (bound, (admitted, rows)) = tokio::join!(feed, drain);
        let bound = bound?.max(since);
        debug!(rows, admitted, since, bound, "Feed drained");
        Ok(bound)
    }

    // ========================================================================
    // Conflict check
    // ========================================================================

    /// Consumes stored resolutions and detects conflicts
    ///
    /// Returns the number of conflicts still open, along with the keep-both
    /// resolutions held back until the gate is clear. Their local records
    /// are already out of the store.
    #[instrument(skip_all, fields(records = store.len()))]
    async fn check_conflicts(
        &self,
        store: &mut ChangeStore,
    ) -> Result<(usize, Vec<(KeepBothAction, ChangeRecord)>), SyncError> {
        self.control.set_state(JobState::ConflictCheck);
        let job_id = self.job.id.as_str();
        let repository = &self.ports.repository;
        let previous: Vec<NodePath> = repository
            .list_conflicts(job_id)
            .await?
            .into_iter()
            .filter(|conflict| conflict.status.is_conflict())
            .map(|conflict| conflict.path)
            .collect();

        let mut keep_both = Vec::new();
        let mut pass = 0;
        loop {
            pass += 1;
            self.apply_resolutions(store, &mut keep_both).await?;

            let scan = ConflictDetector::scan(store.iter());
            let mut converged = Vec::new();
            for (local_id, remote_id) in &scan.converged {
                if let Some(record) = store.remove(*local_id) {
                    converged.push(record.primary_path().clone());
                }
                store.remove(*remote_id);
            }
            repository
                .set_statuses(job_id, &converged, NodeStatus::Idle)
                .await?;

            self.record_conflicts(&scan.conflicts).await?;
            if pass == 1 {
                let detected: HashSet<_> =
                    scan.conflicts.iter().map(|conflict| conflict.path.key()).collect();
                let gone: Vec<NodePath> = previous
                    .iter()
                    .filter(|path| !detected.contains(&path.key()))
                    .cloned()
                    .collect();
                repository
                    .set_statuses(job_id, &gone, NodeStatus::Idle)
                    .await?;
            }

            let auto = self.auto_resolve(&scan.conflicts).await?;
            if auto == 0 || pass == RESOLUTION_PASSES {
                return Ok((scan.conflicts.len(), keep_both));
            }
            debug!(auto, "Conflicts solved by policy, rescanning");
        }
    }

    async fn record_conflicts(&self, conflicts: &[DetectedConflict]) -> Result<(), SyncError> {
        for conflict in conflicts {
            let record = ConflictRecord::open(conflict.path.clone(), conflict.detail.clone());
            self.ports
                .repository
                .save_conflict(&self.job.id, &record)
                .await?;
            self.control.publish(ProgressEvent::ConflictDetected {
                path: conflict.path.clone(),
            });
        }
        Ok(())
    }

    async fn auto_resolve(&self, conflicts: &[DetectedConflict]) -> Result<usize, SyncError> {
        let mut solved = 0;
        for conflict in conflicts {
            if let Some(resolution) = self.policy.auto_resolution(&conflict.path) {
                info!(path = %conflict.path, %resolution, "Conflict solved by policy");
                self.ports
                    .repository
                    .set_status(&self.job.id, &conflict.path, NodeStatus::Solved(resolution))
                    .await?;
                solved += 1;
            }
        }
        Ok(solved)
    }

    async fn apply_resolutions(
        &self,
        store: &mut ChangeStore,
        keep_both: &mut Vec<(KeepBothAction, ChangeRecord)>,
    ) -> Result<(), SyncError> {
        let job_id = self.job.id.as_str();
        let repository = &self.ports.repository;
        let solved: Vec<ConflictRecord> = repository
            .list_conflicts(job_id)
            .await?
            .into_iter()
            .filter(|conflict| conflict.resolution().is_some())
            .collect();
        if solved.is_empty() {
            return Ok(());
        }

        let plan = ResolutionPlan::build(&solved, store.iter());
        for id in &plan.drop {
            store.remove(*id);
        }
        for action in plan.keep_both {
            if let Some(record) = store.remove(action.local_id) {
                keep_both.push((action, record));
            }
        }

        // Keep-both paths stay SOLVED until their move has run
        let consumed: Vec<NodePath> = plan
            .consumed
            .into_iter()
            .filter(|path| !keep_both.iter().any(|(action, _)| action.path.same_node(path)))
            .collect();
        repository
            .set_statuses(job_id, &consumed, NodeStatus::Pending)
            .await?;
        repository
            .set_statuses(job_id, &plan.stale, NodeStatus::Idle)
            .await?;
        Ok(())
    }

    /// Moves the local version aside and queues its upload under the new name
    async fn keep_both(
        &self,
        store: &mut ChangeStore,
        action: &KeepBothAction,
        record: ChangeRecord,
    ) -> Result<(), SyncError> {
        let aside = match self.resolver.move_local_aside(&action.path).await {
            Ok(aside) => aside,
            Err(ConflictError::NotFound(_)) => {
                warn!(path = %action.path, "Local version vanished, keeping the remote one");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        self.ports
            .repository
            .push_echo(
                &self.job.id,
                &EchoRecord::new(
                    Location::Local,
                    ChangeKind::Path,
                    Some(action.path.clone()),
                    Some(aside.clone()),
                ),
            )
            .await?;

        let mut node = record.node.clone();
        node.path = aside.clone();
        let mut copy = ChangeRecord::new(
            Location::Local,
            record.sequence,
            ChangeOp::Create { target: aside },
            node,
        );
        copy.first_sequence = record.first_sequence;
        copy.content_modified = true;
        store.insert(copy);
        Ok(())
    }
}
