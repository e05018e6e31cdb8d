//! In-memory store implementation.
//!
//! Thread-safe backend for testing and development. Data is not persisted
//! across restarts.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

use super::{Mutator, StoreError, TaskFilter, TaskStore};
use crate::core::task::TaskRecord;
use crate::core::types::TaskId;

/// In-memory store backend.
pub struct MemoryStore {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create(&self, record: TaskRecord) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().map_err(|_| StoreError::LockPoisoned)?;
        if tasks.contains_key(&record.id) {
            return Err(StoreError::DuplicateId(record.id));
        }
        tasks.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<TaskRecord, StoreError> {
        let tasks = self.tasks.read().map_err(|_| StoreError::LockPoisoned)?;
        tasks.get(id).cloned().ok_or(StoreError::NotFound(*id))
    }

    async fn update(
        &self,
        id: &TaskId,
        expected_version: u64,
        mutate: Mutator<'_>,
    ) -> Result<TaskRecord, StoreError> {
        let mut tasks = self.tasks.write().map_err(|_| StoreError::LockPoisoned)?;
        let record = tasks.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        if record.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: *id,
                expected: expected_version,
                actual: record.version,
            });
        }
        mutate(record);
        record.version = expected_version + 1;
        record.updated_at = SystemTime::now();
        Ok(record.clone())
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StoreError> {
        let tasks = self.tasks.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut result: Vec<_> = tasks
            .values()
            .filter(|t| filter.owner.as_deref().is_none_or(|o| t.owner == o))
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        // Newest first; id as a tie-breaker so pagination is stable.
        result.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.as_uuid().cmp(a.id.as_uuid()))
        });
        Ok(result
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    async fn delete(&self, id: &TaskId) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().map_err(|_| StoreError::LockPoisoned)?;
        tasks.remove(id).ok_or(StoreError::NotFound(*id))?;
        Ok(())
    }

    async fn list_unfinished(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let tasks = self.tasks.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tasks
            .values()
            .filter(|t| t.status.is_active())
            .cloned()
            .collect())
    }

    async fn list_expired(&self, cutoff: SystemTime) -> Result<Vec<TaskRecord>, StoreError> {
        let tasks = self.tasks.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .filter(|t| t.completed_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect())
    }
}
