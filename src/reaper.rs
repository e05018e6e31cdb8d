//! Retention reaper for terminal tasks.
//!
//! Terminal tasks older than the retention window are deleted together with
//! their artifacts. Sweeps are driven by an interval loop but [`sweep`] can
//! also be invoked directly (tests, one-shot CLI maintenance).

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;

use crate::stage::remove_artifact;
use crate::store::{StoreError, TaskStore};

/// Deletes expired terminal tasks and their artifacts.
#[derive(Clone)]
pub struct RetentionReaper {
    store: Arc<dyn TaskStore>,
}

impl RetentionReaper {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Delete every terminal task whose `completed_at` is strictly older than
    /// `max_age` relative to `now`. Returns the number of tasks removed.
    ///
    /// A `max_age` too large to subtract from `now` means nothing can be
    /// expired, so the sweep is a no-op rather than an error.
    pub async fn sweep(&self, now: SystemTime, max_age: Duration) -> Result<usize, StoreError> {
        let Some(cutoff) = now.checked_sub(max_age) else {
            return Ok(0);
        };

        let expired = self.store.list_expired(cutoff).await?;
        let mut removed = 0;
        for task in expired {
            if let Some(output_ref) = &task.output_ref {
                if let Err(err) = remove_artifact(Path::new(output_ref)).await {
                    // Keep the record so the next sweep retries the artifact.
                    tracing::warn!(task_id = %task.id, output_ref = %output_ref, error = %err, "artifact removal failed");
                    continue;
                }
            }
            match self.store.delete(&task.id).await {
                Ok(()) => removed += 1,
                Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        if removed > 0 {
            tracing::info!(removed, "retention sweep purged expired tasks");
        }
        Ok(removed)
    }

    /// Spawn a background loop sweeping every `interval`.
    pub fn spawn_interval(self, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh start does
            // not race crash recovery.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = self.sweep(SystemTime::now(), max_age).await {
                    tracing::error!(error = %err, "retention sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{ProcessingMode, TaskRecord};
    use crate::store::{update_task, MemoryStore};

    async fn terminal_task(store: &MemoryStore, output: Option<&str>) -> crate::core::types::TaskId {
        let task = TaskRecord::new("u1", "v1", ProcessingMode::Plain);
        let id = task.id;
        store.create(task).await.unwrap();
        let output = output.map(str::to_string);
        update_task(store, &id, move |t| match &output {
            Some(path) => {
                t.mark_downloading();
                t.mark_processing();
                t.mark_completed(path.clone());
            }
            None => t.mark_cancelled(),
        })
        .await
        .unwrap();
        id
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_tasks_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("out.mp4");
        tokio::fs::write(&artifact, b"media").await.unwrap();

        let store = Arc::new(MemoryStore::new());
        let id = terminal_task(&store, Some(&artifact.to_string_lossy())).await;

        let reaper = RetentionReaper::new(store.clone());
        let future = SystemTime::now() + Duration::from_secs(3600);
        let removed = reaper.sweep(future, Duration::from_secs(60)).await.unwrap();

        assert_eq!(removed, 1);
        assert!(!artifact.exists());
        assert!(matches!(
            store.get(&id).await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_sweep_keeps_tasks_inside_the_window() {
        let store = Arc::new(MemoryStore::new());
        let id = terminal_task(&store, None).await;

        let reaper = RetentionReaper::new(store.clone());
        let removed = reaper
            .sweep(SystemTime::now(), Duration::from_secs(86_400))
            .await
            .unwrap();

        assert_eq!(removed, 0);
        assert!(store.get(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_sweep_ignores_active_tasks() {
        let store = Arc::new(MemoryStore::new());
        let task = TaskRecord::new("u1", "v1", ProcessingMode::Plain);
        let id = task.id;
        store.create(task).await.unwrap();

        let reaper = RetentionReaper::new(store.clone());
        let future = SystemTime::now() + Duration::from_secs(3600);
        let removed = reaper.sweep(future, Duration::ZERO).await.unwrap();

        assert_eq!(removed, 0);
        assert!(store.get(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_oversized_max_age_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        terminal_task(&store, None).await;

        let reaper = RetentionReaper::new(store);
        let removed = reaper
            .sweep(SystemTime::UNIX_EPOCH, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_missing_artifact_does_not_block_deletion() {
        let store = Arc::new(MemoryStore::new());
        let id = terminal_task(&store, Some("/nonexistent/artifacts/gone.mp4")).await;

        let reaper = RetentionReaper::new(store.clone());
        let future = SystemTime::now() + Duration::from_secs(3600);
        let removed = reaper.sweep(future, Duration::from_secs(1)).await.unwrap();

        assert_eq!(removed, 1);
        assert!(store.get(&id).await.is_err());
    }
}
