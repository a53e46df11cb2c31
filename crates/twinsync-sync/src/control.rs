//! Job control surface
//!
//! A [`JobControl`] is the cloneable handle the outside world holds on a
//! running job. It carries:
//! - cooperative interruption: pause/resume/stop/start-now, checked by the
//!   orchestrator and the applier at every loop iteration
//! - progress: a `watch` channel with the latest [`JobProgress`] snapshot
//!   and a `broadcast` channel of [`ProgressEvent`]s
//! - conflict decisions, written through to the state repository and
//!   consumed at the next conflict check

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use twinsync_core::domain::{
    ChangeKind, ConflictRecord, Location, NodePath, NodeStatus, Resolution,
};
use twinsync_core::ports::IStateRepository;

use crate::SyncError;

/// Capacity of the progress event channel
const EVENT_CAPACITY: usize = 256;

// ============================================================================
// Progress types
// ============================================================================

/// Which sleep interval the orchestrator is waiting out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepMode {
    Online,
    Offline,
}

/// Orchestrator state as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "mode")]
pub enum JobState {
    Sleeping(SleepMode),
    /// A replica volume is missing
    Waiting,
    Fetching,
    Reducing,
    ConflictCheck,
    Applying,
    Checkpointing,
    Paused,
    Stopped,
}

/// Counters readable by the control surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub state: JobState,
    pub online: bool,
    pub queue_length: usize,
    pub queue_done: usize,
    pub queue_bytes: u64,
    pub conflicts: usize,
    pub last_error: Option<String>,
}

impl Default for JobProgress {
    fn default() -> Self {
        Self {
            state: JobState::Sleeping(SleepMode::Online),
            online: false,
            queue_length: 0,
            queue_done: 0,
            queue_bytes: 0,
            conflicts: 0,
            last_error: None,
        }
    }
}

/// Result counters of one finished cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub fetched: usize,
    pub reduced: usize,
    pub applied: usize,
    pub failed: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub duration_ms: u64,
}

/// Events pushed to subscribers while a job runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum ProgressEvent {
    StateChanged {
        state: JobState,
    },
    Applied {
        location: Location,
        kind: ChangeKind,
        path: NodePath,
    },
    Failed {
        path: NodePath,
        message: String,
    },
    ConflictDetected {
        path: NodePath,
    },
    CycleCompleted {
        summary: CycleSummary,
    },
}

// ============================================================================
// JobControl
// ============================================================================

struct Inner {
    job_id: String,
    repository: Arc<dyn IStateRepository>,
    cancel: CancellationToken,
    paused: AtomicBool,
    run_requested: AtomicBool,
    wake: Notify,
    progress: watch::Sender<JobProgress>,
    events: broadcast::Sender<ProgressEvent>,
}

/// Cloneable handle on one job
#[derive(Clone)]
pub struct JobControl {
    inner: Arc<Inner>,
}

impl JobControl {
    pub fn new(job_id: impl Into<String>, repository: Arc<dyn IStateRepository>) -> Self {
        let (progress, _) = watch::channel(JobProgress::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                job_id: job_id.into(),
                repository,
                cancel: CancellationToken::new(),
                paused: AtomicBool::new(false),
                run_requested: AtomicBool::new(false),
                wake: Notify::new(),
                progress,
                events,
            }),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.inner.job_id
    }

    // --- Commands ---

    /// Suspends the job after the in-flight operations finish
    pub fn pause(&self) {
        info!(job = %self.inner.job_id, "Pause requested");
        self.inner.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        info!(job = %self.inner.job_id, "Resume requested");
        self.inner.paused.store(false, Ordering::Release);
        self.inner.wake.notify_waiters();
    }

    /// Ends the job loop; cannot be undone
    pub fn stop(&self) {
        info!(job = %self.inner.job_id, "Stop requested");
        self.inner.cancel.cancel();
        self.inner.wake.notify_waiters();
    }

    /// Runs a cycle now, cutting the current sleep short
    pub fn start_now(&self) {
        info!(job = %self.inner.job_id, "Immediate cycle requested");
        self.inner.run_requested.store(true, Ordering::Release);
        self.inner.wake.notify_waiters();
    }

    /// Records a user decision for a conflicting node
    ///
    /// # Errors
    /// Fails unless the node is currently in CONFLICT (or already solved,
    /// in which case the decision is replaced).
    pub async fn submit_resolution(
        &self,
        path: &NodePath,
        resolution: Resolution,
    ) -> Result<(), SyncError> {
        let repository = &self.inner.repository;
        let current = repository
            .get_status(&self.inner.job_id, path)
            .await?
            .ok_or_else(|| {
                SyncError::Conflict(twinsync_conflict::ConflictError::NotFound(path.to_string()))
            })?;
        let solved = current.resolve(resolution)?;
        repository
            .set_status(&self.inner.job_id, path, solved)
            .await?;

        info!(job = %self.inner.job_id, path = %path, resolution = %resolution, "Conflict resolution recorded");
        Ok(())
    }

    /// Nodes currently in CONFLICT or SOLVED:* status
    pub async fn conflicts(&self) -> Result<Vec<ConflictRecord>, SyncError> {
        Ok(self.inner.repository.list_conflicts(&self.inner.job_id).await?)
    }

    // --- Queries ---

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// True if the running phase should stop at the next check
    pub fn is_interrupted(&self) -> bool {
        self.is_paused() || self.is_stopped()
    }

    /// Consumes a pending start-now request
    pub fn take_run_request(&self) -> bool {
        self.inner.run_requested.swap(false, Ordering::AcqRel)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn progress(&self) -> JobProgress {
        self.inner.progress.borrow().clone()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<JobProgress> {
        self.inner.progress.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.events.subscribe()
    }

    // --- Orchestrator side ---

    pub(crate) fn update_progress(&self, update: impl FnOnce(&mut JobProgress)) {
        self.inner.progress.send_modify(update);
    }

    pub(crate) fn set_state(&self, state: JobState) {
        let changed = self.inner.progress.send_if_modified(|progress| {
            if progress.state == state {
                return false;
            }
            progress.state = state;
            true
        });
        if changed {
            debug!(job = %self.inner.job_id, ?state, "Job state changed");
            self.publish(ProgressEvent::StateChanged { state });
        }
    }

    pub(crate) fn publish(&self, event: ProgressEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Sleeps for `duration`, or until woken by start-now, resume or stop
    ///
    /// `None` sleeps until woken.
    pub(crate) async fn sleep(&self, duration: Option<Duration>) {
        let notified = self.inner.wake.notified();
        tokio::pin!(notified);
        // register before checking, so a wake-up between check and await is kept
        notified.as_mut().enable();
        if self.is_stopped() || self.inner.run_requested.load(Ordering::Acquire) {
            return;
        }

        match duration {
            Some(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {}
                    _ = &mut notified => {}
                    _ = self.inner.cancel.cancelled() => {}
                }
            }
            None => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = self.inner.cancel.cancelled() => {}
                }
            }
        }
    }

    /// Waits while paused; returns false if the job was stopped meanwhile
    pub(crate) async fn wait_while_paused(&self) -> bool {
        while self.is_paused() && !self.is_stopped() {
            let notified = self.inner.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_paused() {
                break;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.inner.cancel.cancelled() => {}
            }
        }
        !self.is_stopped()
    }
}
