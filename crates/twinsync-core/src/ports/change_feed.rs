//! Change feed ports (driven/secondary ports)
//!
//! Both sides report their history as raw rows, grouped by entity and
//! ordered by sequence inside each group. Rows are streamed into an
//! `mpsc` sink so the engine can flatten them as they arrive.
//!
//! ## Contract
//!
//! - Every row sent has `seq >= since`.
//! - The returned value is the upper bound: one past the highest sequence
//!   the feed observed, or `since` when nothing new exists.
//! - If the sink is closed the feed stops and returns
//!   [`AdapterError::Interrupted`].

use tokio::sync::mpsc;

use crate::domain::RawChangeRow;
use crate::ports::sync_adapter::AdapterError;

// ============================================================================
// IRemoteChangeFeed
// ============================================================================

/// Paged change feed of the remote server
#[async_trait::async_trait]
pub trait IRemoteChangeFeed: Send + Sync {
    /// Streams every remote row with `seq >= since` into `sink`
    async fn fetch_changes(
        &self,
        since: u64,
        sink: mpsc::Sender<RawChangeRow>,
    ) -> Result<u64, AdapterError>;
}

// ============================================================================
// ILocalEventSource
// ============================================================================

/// Raw local events recorded by the filesystem watcher
#[async_trait::async_trait]
pub trait ILocalEventSource: Send + Sync {
    /// Streams every local row with `seq >= since` into `sink`
    async fn read_events(
        &self,
        since: u64,
        sink: mpsc::Sender<RawChangeRow>,
    ) -> Result<u64, AdapterError>;

    /// True while the watcher is still absorbing a burst of writes
    fn is_writing(&self) -> bool {
        false
    }
}
