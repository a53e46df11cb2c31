//! State repository port (driven/secondary port)
//!
//! This module defines the interface for persisting engine state across
//! cycles and restarts: sequence watermarks, the echo buffer, node
//! statuses (including conflicts) and the failure history.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific
//!   (SQLite, in-memory, etc.) and don't need domain-level classification.
//! - Every call is scoped by job id, so one store can serve several jobs.
//! - The echo buffer is a multiset: pushing the same echo twice suppresses
//!   two matching changes.

use crate::domain::{
    BufferedEcho, ConflictRecord, EchoRecord, FailureEntry, NodePath, NodeStatus, Watermarks,
};

/// Port trait for durable engine state
#[async_trait::async_trait]
pub trait IStateRepository: Send + Sync {
    // --- Watermarks ---

    /// Loads the job's watermarks; both are 0 for a job never run
    async fn load_watermarks(&self, job_id: &str) -> anyhow::Result<Watermarks>;

    /// Persists the job's watermarks (insert or replace)
    async fn save_watermarks(&self, job_id: &str, marks: &Watermarks) -> anyhow::Result<()>;

    // --- Echo buffer ---

    /// Records an operation the engine has just performed
    async fn push_echo(&self, job_id: &str, echo: &EchoRecord) -> anyhow::Result<()>;

    /// Lists the buffered echoes in insertion order
    async fn list_echoes(&self, job_id: &str) -> anyhow::Result<Vec<BufferedEcho>>;

    /// Binds each echo id to the feed sequence of the change it suppressed
    async fn bind_echoes(&self, job_id: &str, matches: &[(i64, u64)]) -> anyhow::Result<()>;

    /// Drops the echoes one ingest has finished with; returns how many went
    ///
    /// Of the echoes with insertion id up to `up_to`, this removes the
    /// unbound ones and those bound below their location's watermark in
    /// `marks`. `up_to` comes from [`IStateRepository::echo_high_water`],
    /// so echoes pushed after the listing survive.
    async fn expire_echoes(
        &self,
        job_id: &str,
        up_to: i64,
        marks: &Watermarks,
    ) -> anyhow::Result<u64>;

    /// Highest echo insertion id currently stored, 0 when empty
    async fn echo_high_water(&self, job_id: &str) -> anyhow::Result<i64>;

    // --- Node status ---

    /// Returns the node's status, if it has one
    async fn get_status(&self, job_id: &str, path: &NodePath) -> anyhow::Result<Option<NodeStatus>>;

    /// Sets one node's status, keeping any conflict detail
    async fn set_status(&self, job_id: &str, path: &NodePath, status: NodeStatus)
        -> anyhow::Result<()>;

    /// Sets the same status on many nodes in one transaction
    async fn set_statuses(
        &self,
        job_id: &str,
        paths: &[NodePath],
        status: NodeStatus,
    ) -> anyhow::Result<()>;

    /// Moves every NEW node to IDLE; returns how many changed
    async fn mark_new_as_idle(&self, job_id: &str) -> anyhow::Result<u64>;

    // --- Conflicts ---

    /// Stores a conflict record (status and detail)
    async fn save_conflict(&self, job_id: &str, conflict: &ConflictRecord) -> anyhow::Result<()>;

    /// Returns the conflict record of a node in CONFLICT or SOLVED:* status
    async fn get_conflict(&self, job_id: &str, path: &NodePath)
        -> anyhow::Result<Option<ConflictRecord>>;

    /// Lists every node in CONFLICT or SOLVED:* status, ordered by path
    async fn list_conflicts(&self, job_id: &str) -> anyhow::Result<Vec<ConflictRecord>>;

    // --- Failure history ---

    /// Appends a failure entry, trimming the job's history to its cap
    async fn record_failure(&self, entry: &FailureEntry) -> anyhow::Result<()>;

    /// Returns the most recent failures, newest first
    async fn list_failures(&self, job_id: &str, limit: u32) -> anyhow::Result<Vec<FailureEntry>>;
}
