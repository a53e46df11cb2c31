//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! reconciliation engine. The engine depends on these interfaces; their
//! implementations live in adapter crates or in the embedding application.
//!
//! ## Ports Overview
//!
//! - [`IRemoteChangeFeed`] - Ordered raw change rows from the remote server
//! - [`ILocalEventSource`] - Ordered raw change rows from the local watcher index
//! - [`ISyncAdapter`] - Stat/mkdir/delete/move/transfer operations on one replica
//! - [`IStateRepository`] - Durable watermarks, echoes, node statuses and failures

pub mod change_feed;
pub mod state_repository;
pub mod sync_adapter;

pub use change_feed::{ILocalEventSource, IRemoteChangeFeed};
pub use state_repository::IStateRepository;
pub use sync_adapter::{AdapterError, ISyncAdapter};
