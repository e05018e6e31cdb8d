//! The orchestrator facade.
//!
//! Single entry point tying the store, admission gate, worker pool, and
//! retention reaper together. All caller-facing operations (submit, poll,
//! cancel, delete) go through here and enforce ownership before touching
//! task state.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::OrchestratorConfig;
use crate::core::task::{ProcessingMode, TaskFailure, TaskRecord, TaskStatus};
use crate::core::types::TaskId;
use crate::events::{Event, EventBus};
use crate::pipeline::{
    AdmissionGate, CancelRegistry, PipelineRunner, PoolClosed, RunRequest, WorkerPool,
};
use crate::reaper::RetentionReaper;
use crate::stage::{remove_artifact, StageExecutor};
use crate::store::{update_task, StoreError, TaskFilter, TaskStore};

/// Caller-facing error taxonomy.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The request was malformed (empty field, unknown mode).
    #[error("invalid request: {0}")]
    Validation(String),

    /// No such task.
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// The task exists but belongs to a different owner.
    #[error("task {0} belongs to a different owner")]
    Forbidden(TaskId),

    /// The operation is not legal in the task's current state.
    #[error("conflicting state: {0}")]
    Conflict(String),

    /// The submission queue is shut down.
    #[error(transparent)]
    Pool(#[from] PoolClosed),

    /// Storage-layer failure.
    #[error(transparent)]
    Store(StoreError),

    /// Filesystem failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => OrchestratorError::NotFound(id),
            other => OrchestratorError::Store(other),
        }
    }
}

/// Facade over the whole engine.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn TaskStore>,
    registry: CancelRegistry,
    gate: Arc<AdmissionGate>,
    pool: WorkerPool,
    events: EventBus,
    reaper: RetentionReaper,
    reaper_task: JoinHandle<()>,
}

impl Orchestrator {
    /// Recover interrupted work, wire the pipeline together, and start the
    /// background reaper.
    pub async fn start(
        config: OrchestratorConfig,
        store: Arc<dyn TaskStore>,
        downloader: Arc<dyn StageExecutor>,
        transformer: Arc<dyn StageExecutor>,
        events: EventBus,
    ) -> Result<Arc<Self>, OrchestratorError> {
        tokio::fs::create_dir_all(&config.artifact_dir).await?;
        tokio::fs::create_dir_all(&config.work_dir).await?;

        recover_interrupted(store.as_ref()).await?;

        let registry = CancelRegistry::new();
        let gate = Arc::new(AdmissionGate::new(config.max_concurrent_runs));
        let runner = Arc::new(PipelineRunner::new(
            Arc::clone(&store),
            downloader,
            transformer,
            events.clone(),
            registry.clone(),
        ));
        let pool = WorkerPool::start(Arc::clone(&gate), runner);

        let reaper = RetentionReaper::new(Arc::clone(&store));
        let reaper_task = reaper
            .clone()
            .spawn_interval(config.sweep_interval, config.retention);

        Ok(Arc::new(Self {
            config,
            store,
            registry,
            gate,
            pool,
            events,
            reaper,
            reaper_task,
        }))
    }

    /// Accept a new task and queue its pipeline run.
    pub async fn submit(
        &self,
        owner: &str,
        source_ref: &str,
        mode: &str,
    ) -> Result<TaskRecord, OrchestratorError> {
        if owner.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "owner must not be empty".to_string(),
            ));
        }
        if source_ref.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "source reference must not be empty".to_string(),
            ));
        }
        let mode = ProcessingMode::from_str(mode)
            .map_err(|err| OrchestratorError::Validation(err.to_string()))?;

        let record = TaskRecord::new(owner, source_ref, mode);
        let id = record.id;
        self.store.create(record.clone()).await?;

        let cancel = self.registry.register(id).await;
        if let Err(closed) = self.pool.submit(RunRequest {
            task_id: id,
            cancel,
        }) {
            // The dispatcher is gone; settle the record instead of leaving
            // it pending forever.
            self.registry.remove(&id).await;
            if let Err(err) = update_task(self.store.as_ref(), &id, |t| {
                t.mark_failed(TaskFailure::interrupted());
            })
            .await
            {
                tracing::error!(task_id = %id, error = %err, "failed to settle rejected submission");
            }
            return Err(closed.into());
        }
        self.events.emit(Event::submitted(id, owner)).await;

        Ok(record)
    }

    /// Fetch one task, enforcing ownership.
    pub async fn get(&self, owner: &str, id: &TaskId) -> Result<TaskRecord, OrchestratorError> {
        let record = self.store.get(id).await?;
        check_owner(&record, owner)?;
        Ok(record)
    }

    /// List the caller's tasks, newest first.
    pub async fn list(
        &self,
        owner: &str,
        filter: TaskFilter,
    ) -> Result<Vec<TaskRecord>, OrchestratorError> {
        let filter = filter.with_owner(owner);
        Ok(self.store.list(&filter).await?)
    }

    /// Request cancellation of a task that has not passed the commit point.
    ///
    /// The terminal record is written first; the in-flight run (if any) is
    /// signalled only after the write lands, so a cancellation that loses the
    /// commit-point race never disturbs the winning run.
    pub async fn cancel(&self, owner: &str, id: &TaskId) -> Result<TaskRecord, OrchestratorError> {
        loop {
            let record = self.store.get(id).await?;
            check_owner(&record, owner)?;
            if !record.status.is_cancellable() {
                return Err(OrchestratorError::Conflict(format!(
                    "task is {} and can no longer be cancelled",
                    record.status
                )));
            }

            match self
                .store
                .update(id, record.version, &|t: &mut TaskRecord| t.mark_cancelled())
                .await
            {
                Ok(record) => {
                    if let Some(flag) = self.registry.get(id).await {
                        flag.cancel();
                    }
                    self.events.emit(Event::cancelled(*id)).await;
                    return Ok(record);
                }
                // The run advanced concurrently; re-read and re-judge.
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Delete a terminal task and its artifact.
    pub async fn delete(&self, owner: &str, id: &TaskId) -> Result<(), OrchestratorError> {
        let record = self.store.get(id).await?;
        check_owner(&record, owner)?;
        if record.status.is_active() {
            return Err(OrchestratorError::Conflict(format!(
                "task is {} and must finish or be cancelled before deletion",
                record.status
            )));
        }

        if let Some(output_ref) = &record.output_ref {
            remove_artifact(std::path::Path::new(output_ref)).await?;
        }
        self.store.delete(id).await?;
        Ok(())
    }

    /// Resolve the artifact path of a completed task.
    pub async fn artifact_path(
        &self,
        owner: &str,
        id: &TaskId,
    ) -> Result<PathBuf, OrchestratorError> {
        let record = self.get(owner, id).await?;
        match (record.status, record.output_ref) {
            (TaskStatus::Completed, Some(output_ref)) => Ok(PathBuf::from(output_ref)),
            (status, _) => Err(OrchestratorError::Conflict(format!(
                "task is {} and has no artifact to serve",
                status
            ))),
        }
    }

    /// Run one retention sweep immediately.
    pub async fn sweep_now(&self) -> Result<usize, OrchestratorError> {
        Ok(self
            .reaper
            .sweep(SystemTime::now(), self.config.retention)
            .await?)
    }

    /// Effective configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Stop admitting new runs and halt the background reaper. In-flight
    /// pipeline runs are left to reach their terminal state; queued tasks are
    /// settled as failed.
    pub fn shutdown(&self) {
        self.gate.close();
        self.reaper_task.abort();
    }
}

fn check_owner(record: &TaskRecord, owner: &str) -> Result<(), OrchestratorError> {
    if record.owner == owner {
        Ok(())
    } else {
        Err(OrchestratorError::Forbidden(record.id))
    }
}

/// Mark every task that was mid-flight at shutdown as failed.
///
/// Resuming a half-finished download or transform is not safe, so a restart
/// settles interrupted work into a clearly reported terminal state instead of
/// leaving it stuck in an active status forever.
async fn recover_interrupted(store: &dyn TaskStore) -> Result<(), StoreError> {
    let unfinished = store.list_unfinished().await?;
    let count = unfinished.len();
    for task in unfinished {
        update_task(store, &task.id, |t| {
            t.mark_failed(TaskFailure::interrupted());
        })
        .await?;
    }
    if count > 0 {
        tracing::warn!(count, "marked interrupted tasks as failed during recovery");
    }
    Ok(())
}
