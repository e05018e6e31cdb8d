//! SQLite store implementation.
//!
//! Durable storage using SQLite. The optimistic-concurrency protocol maps to
//! `UPDATE .. WHERE id = ? AND version = ?`: a stale writer affects zero rows
//! and is rejected with a version conflict.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{Mutator, StoreError, TaskFilter, TaskStore};
use crate::core::task::{ProcessingMode, TaskFailure, TaskRecord, TaskStatus};
use crate::core::types::TaskId;

/// SQLite store backend.
///
/// Creates the schema on construction; safe to reopen an existing database.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn system_time_to_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn millis_to_system_time(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64)
}

fn row_to_record(row: &SqliteRow) -> Result<TaskRecord, StoreError> {
    let id: String = row.get("id");
    let mode: String = row.get("mode");
    let status: String = row.get("status");
    let error: Option<String> = row.get("error");

    Ok(TaskRecord {
        id: id
            .parse::<TaskId>()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        owner: row.get("owner"),
        source_ref: row.get("source_ref"),
        mode: mode
            .parse::<ProcessingMode>()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        status: status
            .parse::<TaskStatus>()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        progress: row.get::<i64, _>("progress").clamp(0, 100) as u8,
        stage_label: row.get("stage_label"),
        created_at: millis_to_system_time(row.get("created_at")),
        updated_at: millis_to_system_time(row.get("updated_at")),
        completed_at: row
            .get::<Option<i64>, _>("completed_at")
            .map(millis_to_system_time),
        output_ref: row.get("output_ref"),
        error: error
            .map(|json| {
                serde_json::from_str::<TaskFailure>(&json)
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .transpose()?,
        version: row.get::<i64, _>("version") as u64,
    })
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn create(&self, record: TaskRecord) -> Result<(), StoreError> {
        let error_json = record
            .error
            .as_ref()
            .map(|f| serde_json::to_string(f).map_err(|e| StoreError::Serialization(e.to_string())))
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO tasks (
                id, owner, source_ref, mode, status, progress, stage_label,
                created_at, updated_at, completed_at, output_ref, error, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.owner)
        .bind(&record.source_ref)
        .bind(record.mode.as_str())
        .bind(record.status.as_str())
        .bind(record.progress as i64)
        .bind(&record.stage_label)
        .bind(system_time_to_millis(record.created_at))
        .bind(system_time_to_millis(record.updated_at))
        .bind(record.completed_at.map(system_time_to_millis))
        .bind(&record.output_ref)
        .bind(error_json)
        .bind(record.version as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateId(record.id));
        }
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<TaskRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .ok_or(StoreError::NotFound(*id))?;
        row_to_record(&row)
    }

    async fn update(
        &self,
        id: &TaskId,
        expected_version: u64,
        mutate: Mutator<'_>,
    ) -> Result<TaskRecord, StoreError> {
        let mut record = self.get(id).await?;
        if record.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: *id,
                expected: expected_version,
                actual: record.version,
            });
        }

        mutate(&mut record);
        record.version = expected_version + 1;
        record.updated_at = SystemTime::now();

        let error_json = record
            .error
            .as_ref()
            .map(|f| serde_json::to_string(f).map_err(|e| StoreError::Serialization(e.to_string())))
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                status = ?, progress = ?, stage_label = ?, updated_at = ?,
                completed_at = ?, output_ref = ?, error = ?, version = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(record.status.as_str())
        .bind(record.progress as i64)
        .bind(&record.stage_label)
        .bind(system_time_to_millis(record.updated_at))
        .bind(record.completed_at.map(system_time_to_millis))
        .bind(&record.output_ref)
        .bind(error_json)
        .bind(record.version as i64)
        .bind(id.to_string())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            // Lost the race between our read and the write; report the
            // version that actually won.
            return match self.get(id).await {
                Ok(current) => Err(StoreError::VersionConflict {
                    id: *id,
                    expected: expected_version,
                    actual: current.version,
                }),
                Err(err) => Err(err),
            };
        }
        Ok(record)
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StoreError> {
        let limit = filter.limit as i64;
        let offset = filter.offset as i64;

        let rows = match (&filter.owner, filter.status) {
            (Some(owner), Some(status)) => {
                sqlx::query(
                    "SELECT * FROM tasks WHERE owner = ? AND status = ? \
                     ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
                )
                .bind(owner)
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
            (Some(owner), None) => {
                sqlx::query(
                    "SELECT * FROM tasks WHERE owner = ? \
                     ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
                )
                .bind(owner)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
            (None, Some(status)) => {
                sqlx::query(
                    "SELECT * FROM tasks WHERE status = ? \
                     ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
            (None, None) => {
                sqlx::query(
                    "SELECT * FROM tasks \
                     ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        rows.iter().map(row_to_record).collect()
    }

    async fn delete(&self, id: &TaskId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(*id));
        }
        Ok(())
    }

    async fn list_unfinished(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE status IN (?, ?, ?) ORDER BY created_at ASC",
        )
        .bind(TaskStatus::Pending.as_str())
        .bind(TaskStatus::Downloading.as_str())
        .bind(TaskStatus::Processing.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        rows.iter().map(row_to_record).collect()
    }

    async fn list_expired(&self, cutoff: SystemTime) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE status IN (?, ?, ?) AND completed_at < ?",
        )
        .bind(TaskStatus::Completed.as_str())
        .bind(TaskStatus::Failed.as_str())
        .bind(TaskStatus::Cancelled.as_str())
        .bind(system_time_to_millis(cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        rows.iter().map(row_to_record).collect()
    }
}
