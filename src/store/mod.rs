//! Durable storage of task records.
//!
//! This module provides a trait-based storage abstraction with pluggable
//! backends (in-memory, SQLite). The store is the sole serialization point
//! per task id: writes are compare-and-set on the record's `version`, so
//! concurrent progress updates and cancellation requests never lose a write.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use std::time::SystemTime;
use thiserror::Error;

use crate::core::task::{TaskRecord, TaskStatus};
use crate::core::types::TaskId;

/// How many times [`update_task`] re-reads and retries before giving up.
const UPDATE_RETRY_LIMIT: usize = 16;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested task does not exist.
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// A task with this id already exists.
    #[error("duplicate task id: {0}")]
    DuplicateId(TaskId),

    /// The persisted version no longer matches the expected one.
    #[error("version conflict on task {id}: expected {expected}, found {actual}")]
    VersionConflict {
        id: TaskId,
        expected: u64,
        actual: u64,
    },

    /// Store lock was poisoned.
    #[error("store lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backend-specific error.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Filter for listing tasks. Results are ordered newest first.
#[derive(Debug, Clone)]
pub struct TaskFilter {
    /// Only tasks belonging to this owner.
    pub owner: Option<String>,
    /// Only tasks in this status.
    pub status: Option<TaskStatus>,
    /// Maximum number of records to return.
    pub limit: usize,
    /// Number of records to skip.
    pub offset: usize,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            owner: None,
            status: None,
            limit: 20,
            offset: 0,
        }
    }
}

impl TaskFilter {
    /// Restrict to one owner.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Restrict to one status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the page size.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Set the page offset.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Mutator applied to a freshly read record inside [`TaskStore::update`].
pub type Mutator<'a> = &'a (dyn Fn(&mut TaskRecord) + Send + Sync);

/// Storage trait for persisting task records.
///
/// All operations are safe to call from multiple concurrent executors.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task record.
    async fn create(&self, record: TaskRecord) -> Result<(), StoreError>;

    /// Get a task by id.
    async fn get(&self, id: &TaskId) -> Result<TaskRecord, StoreError>;

    /// Apply `mutate` to a fresh copy and persist atomically, but only if the
    /// stored version still equals `expected_version`.
    ///
    /// On success the persisted version is `expected_version + 1` and the
    /// record's `updated_at` is refreshed. On mismatch the write is rejected
    /// with [`StoreError::VersionConflict`] and the caller must re-read and
    /// retry (see [`update_task`]).
    async fn update(
        &self,
        id: &TaskId,
        expected_version: u64,
        mutate: Mutator<'_>,
    ) -> Result<TaskRecord, StoreError>;

    /// List tasks matching the filter, newest first.
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StoreError>;

    /// Delete a task record.
    async fn delete(&self, id: &TaskId) -> Result<(), StoreError>;

    /// All tasks in a non-terminal status. Used by crash recovery.
    async fn list_unfinished(&self) -> Result<Vec<TaskRecord>, StoreError>;

    /// All terminal tasks whose `completed_at` is strictly before `cutoff`.
    /// Used by the retention reaper.
    async fn list_expired(&self, cutoff: SystemTime) -> Result<Vec<TaskRecord>, StoreError>;
}

/// Read-modify-write loop around [`TaskStore::update`].
///
/// Version conflicts are retried transparently; they only surface if the
/// retry budget is exhausted, which indicates pathological contention.
pub async fn update_task<F>(
    store: &dyn TaskStore,
    id: &TaskId,
    mutate: F,
) -> Result<TaskRecord, StoreError>
where
    F: Fn(&mut TaskRecord) + Send + Sync,
{
    let mut last_conflict = None;
    for _ in 0..UPDATE_RETRY_LIMIT {
        let current = store.get(id).await?;
        match store.update(id, current.version, &mutate).await {
            Ok(record) => return Ok(record),
            Err(conflict @ StoreError::VersionConflict { .. }) => {
                last_conflict = Some(conflict);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_conflict.unwrap_or(StoreError::NotFound(*id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::ProcessingMode;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_update_task_retries_through_conflicts() {
        let store = Arc::new(MemoryStore::new());
        let task = TaskRecord::new("u1", "v1", ProcessingMode::Plain);
        let id = task.id;
        store.create(task).await.unwrap();

        // Ten concurrent writers all bump progress by one; every write must
        // land (no lost updates, no skipped versions).
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                update_task(store.as_ref(), &id, |t| t.progress += 1)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let final_task = store.get(&id).await.unwrap();
        assert_eq!(final_task.progress, 10);
        assert_eq!(final_task.version, 11);
    }

    #[tokio::test]
    async fn test_update_task_propagates_not_found() {
        let store = MemoryStore::new();
        let missing = TaskId::new();

        let err = update_task(&store, &missing, |t| t.progress = 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == missing));
    }
}
