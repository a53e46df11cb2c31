//! SQLite implementation of IStateRepository
//!
//! This module provides the concrete SQLite-based implementation of the
//! state repository port defined in twinsync-core. It handles domain type
//! conversion and SQL query construction.
//!
//! ## Type Mapping
//!
//! | Domain Type      | SQL Type | Strategy                                   |
//! |------------------|----------|--------------------------------------------|
//! | NodePath         | TEXT     | `as_str()` / `NodePath::new()`; keyed by `PathKey` |
//! | Location         | TEXT     | `"local"` / `"remote"`                     |
//! | ChangeKind       | TEXT     | snake_case label                           |
//! | NodeStatus       | TEXT     | wire string, e.g. `SOLVED:KEEPBOTH`        |
//! | ConflictDetail   | TEXT     | serde_json serialization                   |
//! | ErrorClass       | TEXT     | snake_case label                           |
//! | DateTime<Utc>    | TEXT     | ISO 8601 via `to_rfc3339()`                |
//! | sequence (u64)   | INTEGER  | stored as i64                              |

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use twinsync_core::domain::{
    BufferedEcho, ConflictDetail, ConflictRecord, EchoRecord, FailureEntry, NodePath, NodeStatus,
    Watermarks,
};
use twinsync_core::ports::IStateRepository;

use crate::CacheError;

/// Failure entries kept per job unless configured otherwise
pub const DEFAULT_FAILURE_HISTORY: u32 = 500;

/// SQLite-based implementation of the state repository port
pub struct SqliteStateRepository {
    pool: SqlitePool,
    failure_history: u32,
}

impl SqliteStateRepository {
    /// Creates a new repository instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            failure_history: DEFAULT_FAILURE_HISTORY,
        }
    }

    /// Keeps at most `entries` failures per job (minimum 1)
    pub fn with_failure_history(mut self, entries: u32) -> Self {
        self.failure_history = entries.max(1);
        self
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

/// Parse an RFC 3339 timestamp
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CacheError::SerializationError(format!("Invalid datetime '{}': {}", s, e)))
}

fn parse_optional_path(s: Option<String>) -> Result<Option<NodePath>, CacheError> {
    s.map(NodePath::new).transpose().map_err(CacheError::from)
}

fn echo_from_row(row: &SqliteRow) -> Result<BufferedEcho, CacheError> {
    let location: String = row.get("location");
    let kind: String = row.get("kind");
    let matched_seq: Option<i64> = row.get("matched_seq");
    Ok(BufferedEcho {
        id: row.get("id"),
        echo: EchoRecord {
            location: location.parse()?,
            kind: kind.parse()?,
            source: parse_optional_path(row.get("source"))?,
            target: parse_optional_path(row.get("target"))?,
        },
        matched_seq: matched_seq.map(|seq| seq as u64),
    })
}

fn conflict_from_row(row: &SqliteRow) -> Result<ConflictRecord, CacheError> {
    let path: String = row.get("path");
    let status: String = row.get("status");
    let detail: Option<String> = row.get("detail");

    let detail = detail
        .map(|json| {
            serde_json::from_str::<ConflictDetail>(&json).map_err(|e| {
                CacheError::SerializationError(format!("Invalid conflict detail for {path}: {e}"))
            })
        })
        .transpose()?;

    Ok(ConflictRecord {
        path: NodePath::new(&path)?,
        status: status.parse()?,
        detail,
    })
}

fn failure_from_row(row: &SqliteRow) -> Result<FailureEntry, CacheError> {
    let location: String = row.get("location");
    let kind: String = row.get("kind");
    let class: String = row.get("error_class");
    let failed_at: String = row.get("failed_at");
    Ok(FailureEntry {
        job_id: row.get("job_id"),
        location: location.parse()?,
        kind: kind.parse()?,
        path: parse_optional_path(row.get("path"))?,
        class: class.parse()?,
        message: row.get("message"),
        failed_at: parse_datetime(&failed_at)?,
    })
}

/// Statuses whose conflict detail must survive a status update
const KEEPS_DETAIL: &str = "excluded.status = 'CONFLICT' OR excluded.status LIKE 'SOLVED:%'";

// ============================================================================
// IStateRepository implementation
// ============================================================================

#[async_trait::async_trait]
impl IStateRepository for SqliteStateRepository {
    // --- Watermarks ---

    async fn load_watermarks(&self, job_id: &str) -> anyhow::Result<Watermarks> {
        let row = sqlx::query("SELECT local_seq, remote_seq FROM sequences WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(CacheError::from)?;

        Ok(match row {
            Some(row) => Watermarks {
                local: row.get::<i64, _>("local_seq") as u64,
                remote: row.get::<i64, _>("remote_seq") as u64,
            },
            None => Watermarks::default(),
        })
    }

    async fn save_watermarks(&self, job_id: &str, marks: &Watermarks) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO sequences (job_id, local_seq, remote_seq, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(marks.local as i64)
        .bind(marks.remote as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(CacheError::from)?;

        tracing::trace!(job_id, local = marks.local, remote = marks.remote, "Watermarks saved");
        Ok(())
    }

    // --- Echo buffer ---

    async fn push_echo(&self, job_id: &str, echo: &EchoRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO echoes (job_id, location, kind, source, target) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(echo.location.as_str())
        .bind(echo.kind.as_str())
        .bind(echo.source.as_ref().map(NodePath::as_str))
        .bind(echo.target.as_ref().map(NodePath::as_str))
        .execute(&self.pool)
        .await
        .map_err(CacheError::from)?;
        Ok(())
    }

    async fn list_echoes(&self, job_id: &str) -> anyhow::Result<Vec<BufferedEcho>> {
        let rows = sqlx::query(
            "SELECT id, location, kind, source, target, matched_seq
             FROM echoes WHERE job_id = ? ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(CacheError::from)?;

        let echoes = rows
            .iter()
            .map(echo_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(echoes)
    }

    async fn bind_echoes(&self, job_id: &str, matches: &[(i64, u64)]) -> anyhow::Result<()> {
        if matches.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(CacheError::from)?;
        for (id, seq) in matches {
            sqlx::query("UPDATE echoes SET matched_seq = ? WHERE job_id = ? AND id = ?")
                .bind(*seq as i64)
                .bind(job_id)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(CacheError::from)?;
        }
        tx.commit().await.map_err(CacheError::from)?;

        tracing::trace!(job_id, count = matches.len(), "Echoes bound");
        Ok(())
    }

    async fn expire_echoes(
        &self,
        job_id: &str,
        up_to: i64,
        marks: &Watermarks,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM echoes
             WHERE job_id = ? AND id <= ?
               AND (matched_seq IS NULL
                    OR (location = 'local' AND matched_seq < ?)
                    OR (location = 'remote' AND matched_seq < ?))",
        )
        .bind(job_id)
        .bind(up_to)
        .bind(marks.local as i64)
        .bind(marks.remote as i64)
        .execute(&self.pool)
        .await
        .map_err(CacheError::from)?;
        Ok(result.rows_affected())
    }

    async fn echo_high_water(&self, job_id: &str) -> anyhow::Result<i64> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM echoes WHERE job_id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await
            .map_err(CacheError::from)?;
        Ok(max.unwrap_or(0))
    }

    // --- Node status ---

    async fn get_status(&self, job_id: &str, path: &NodePath) -> anyhow::Result<Option<NodeStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM node_status WHERE job_id = ? AND path_key = ?")
                .bind(job_id)
                .bind(path.key().as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(CacheError::from)?;

        let status = status
            .map(|s| s.parse::<NodeStatus>())
            .transpose()
            .map_err(CacheError::from)?;
        Ok(status)
    }

    async fn set_status(
        &self,
        job_id: &str,
        path: &NodePath,
        status: NodeStatus,
    ) -> anyhow::Result<()> {
        self.set_statuses(job_id, std::slice::from_ref(path), status)
            .await
    }

    async fn set_statuses(
        &self,
        job_id: &str,
        paths: &[NodePath],
        status: NodeStatus,
    ) -> anyhow::Result<()> {
        if paths.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "INSERT INTO node_status (job_id, path_key, path, status, detail, updated_at)
             VALUES (?, ?, ?, ?, NULL, ?)
             ON CONFLICT(job_id, path_key) DO UPDATE SET
                 path = excluded.path,
                 status = excluded.status,
                 detail = CASE WHEN {KEEPS_DETAIL} THEN node_status.detail ELSE NULL END,
                 updated_at = excluded.updated_at"
        );
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await.map_err(CacheError::from)?;
        for path in paths {
            sqlx::query(&sql)
                .bind(job_id)
                .bind(path.key().as_str())
                .bind(path.as_str())
                .bind(status.as_str())
                .bind(&now)
                .execute(&mut *tx)
                .await
                .map_err(CacheError::from)?;
        }
        tx.commit().await.map_err(CacheError::from)?;

        tracing::trace!(job_id, count = paths.len(), status = %status, "Node statuses set");
        Ok(())
    }

    async fn mark_new_as_idle(&self, job_id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE node_status SET status = 'IDLE', updated_at = ?
             WHERE job_id = ? AND status = 'NEW'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(CacheError::from)?;
        Ok(result.rows_affected())
    }

    // --- Conflicts ---

    async fn save_conflict(&self, job_id: &str, conflict: &ConflictRecord) -> anyhow::Result<()> {
        let detail = conflict
            .detail
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| anyhow::anyhow!("Failed to serialize conflict detail: {}", e))?;

        sqlx::query(
            "INSERT OR REPLACE INTO node_status (job_id, path_key, path, status, detail, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(conflict.path.key().as_str())
        .bind(conflict.path.as_str())
        .bind(conflict.status.as_str())
        .bind(detail)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(CacheError::from)?;
        Ok(())
    }

    async fn get_conflict(
        &self,
        job_id: &str,
        path: &NodePath,
    ) -> anyhow::Result<Option<ConflictRecord>> {
        let row = sqlx::query(
            "SELECT path, status, detail FROM node_status
             WHERE job_id = ? AND path_key = ?
               AND (status = 'CONFLICT' OR status LIKE 'SOLVED:%')",
        )
        .bind(job_id)
        .bind(path.key().as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(CacheError::from)?;

        Ok(row.as_ref().map(conflict_from_row).transpose()?)
    }

    async fn list_conflicts(&self, job_id: &str) -> anyhow::Result<Vec<ConflictRecord>> {
        let rows = sqlx::query(
            "SELECT path, status, detail FROM node_status
             WHERE job_id = ? AND (status = 'CONFLICT' OR status LIKE 'SOLVED:%')
             ORDER BY path_key",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(CacheError::from)?;

        let conflicts = rows
            .iter()
            .map(conflict_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(conflicts)
    }

    // --- Failure history ---

    async fn record_failure(&self, entry: &FailureEntry) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.map_err(CacheError::from)?;
        sqlx::query(
            "INSERT INTO failures (job_id, location, kind, path, error_class, message, failed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.job_id)
        .bind(entry.location.as_str())
        .bind(entry.kind.as_str())
        .bind(entry.path.as_ref().map(NodePath::as_str))
        .bind(entry.class.as_str())
        .bind(&entry.message)
        .bind(entry.failed_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(CacheError::from)?;

        let trimmed = sqlx::query(
            "DELETE FROM failures
             WHERE job_id = ? AND id NOT IN (
                 SELECT id FROM failures WHERE job_id = ? ORDER BY id DESC LIMIT ?
             )",
        )
        .bind(&entry.job_id)
        .bind(&entry.job_id)
        .bind(self.failure_history as i64)
        .execute(&mut *tx)
        .await
        .map_err(CacheError::from)?;
        tx.commit().await.map_err(CacheError::from)?;

        if trimmed.rows_affected() > 0 {
            tracing::trace!(
                job_id = %entry.job_id,
                trimmed = trimmed.rows_affected(),
                "Failure history trimmed"
            );
        }
        Ok(())
    }

    async fn list_failures(&self, job_id: &str, limit: u32) -> anyhow::Result<Vec<FailureEntry>> {
        let rows = sqlx::query(
            "SELECT job_id, location, kind, path, error_class, message, failed_at
             FROM failures WHERE job_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(job_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(CacheError::from)?;

        let failures = rows
            .iter()
            .map(failure_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(failures)
    }
}
