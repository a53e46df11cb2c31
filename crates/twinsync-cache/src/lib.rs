//! TwinSync Cache - Durable engine state
//!
//! SQLite-based persistence for:
//! - Per-location sequence watermarks
//! - The echo buffer
//! - Node statuses and conflict details
//! - Failure history
//!
//! ## Architecture
//!
//! This crate implements the `IStateRepository` port from `twinsync-core`
//! using SQLite as the storage backend. It is a driven (secondary) adapter
//! in the hexagonal architecture.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool with migration support
//! - [`SqliteStateRepository`] - Full `IStateRepository` implementation
//! - [`CacheError`] - Error types for cache operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use twinsync_cache::{DatabasePool, SqliteStateRepository};
//! use twinsync_core::config::Config;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::default();
//! let pool = DatabasePool::new(Path::new("/home/user/.local/share/twinsync/state.db")).await?;
//! let repo = SqliteStateRepository::new(pool.pool().clone())
//!     .with_failure_history(config.state.failure_history);
//! // Use repo as IStateRepository...
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod repository;

pub use pool::DatabasePool;
pub use repository::SqliteStateRepository;

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Serialization or deserialization of domain types failed
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}

impl From<twinsync_core::domain::DomainError> for CacheError {
    fn from(e: twinsync_core::domain::DomainError) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}
