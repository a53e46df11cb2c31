//! Database connection pool management
//!
//! Wraps SQLx's `SqlitePool`. File databases run in WAL mode so progress
//! writes from the apply phase never block status reads from the control
//! surface. The schema is applied on every open and is idempotent.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::CacheError;

/// Maximum connections for a file database
const FILE_POOL_SIZE: u32 = 5;

/// How long a writer waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const INITIAL_MIGRATION: &str = include_str!("migrations/20261014_initial.sql");

/// Pool of SQLite connections holding TwinSync engine state
#[derive(Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens (creating if needed) the database at `db_path`
    ///
    /// Parent directories are created, WAL mode is enabled and the schema
    /// is applied.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::ConnectionFailed` if the file cannot be opened,
    /// or `CacheError::MigrationFailed` if the schema cannot be applied.
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "cannot create state directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(FILE_POOL_SIZE)
            .connect_with(options)
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "cannot open state database {}: {e}",
                    db_path.display()
                ))
            })?;

        Self::migrate(&pool).await?;

        tracing::info!(path = %db_path.display(), "State database opened");
        Ok(Self { pool })
    }

    /// Opens a private in-memory database
    ///
    /// SQLite in-memory databases live per connection, so the pool holds
    /// exactly one.
    pub async fn in_memory() -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CacheError::ConnectionFailed(format!("in-memory database: {e}")))?;

        Self::migrate(&pool).await?;

        tracing::debug!("In-memory state database opened");
        Ok(Self { pool })
    }

    /// Returns a reference to the underlying SQLite connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every connection, flushing the WAL
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), CacheError> {
        sqlx::raw_sql(INITIAL_MIGRATION)
            .execute(pool)
            .await
            .map_err(|e| CacheError::MigrationFailed(format!("initial schema: {e}")))?;
        tracing::debug!("State schema up to date");
        Ok(())
    }
}
