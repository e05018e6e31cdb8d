//! Drives one task through the download and transform stages.
//!
//! The runner owns no state of its own: every transition is a
//! compare-and-set against the store, so a concurrent cancellation and the
//! runner's own progress race safely. Whichever write lands first wins and
//! the loser observes the new state on re-read.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::task::{TaskFailure, TaskRecord};
use crate::core::types::TaskId;
use crate::events::{Event, EventBus};
use crate::stage::{remove_artifact, ProgressSender, StageError, StageExecutor};
use crate::store::{StoreError, TaskStore};

use super::cancel::{CancelFlag, CancelRegistry};
use super::gate::Permit;

/// Overall progress covered by the download stage.
const DOWNLOAD_BASE: u8 = 5;
const DOWNLOAD_SPAN: u8 = 35;
/// Overall progress covered by the transform stage.
const TRANSFORM_BASE: u8 = 40;
const TRANSFORM_SPAN: u8 = 55;
/// Minimum overall-progress delta worth a persisted write.
const PROGRESS_STRIDE: u8 = 5;

/// Outcome of a compare-and-set transition attempt.
enum Advance {
    /// The transition landed.
    Advanced(TaskRecord),
    /// The task reached a terminal state through another writer.
    Halted(TaskRecord),
}

/// Executes the two-stage pipeline for admitted tasks.
pub struct PipelineRunner {
    store: Arc<dyn TaskStore>,
    downloader: Arc<dyn StageExecutor>,
    transformer: Arc<dyn StageExecutor>,
    events: EventBus,
    registry: CancelRegistry,
}

impl PipelineRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        downloader: Arc<dyn StageExecutor>,
        transformer: Arc<dyn StageExecutor>,
        events: EventBus,
        registry: CancelRegistry,
    ) -> Self {
        Self {
            store,
            downloader,
            transformer,
            events,
            registry,
        }
    }

    /// Run the pipeline for one task. The admission permit is held until this
    /// returns, on every path.
    pub async fn run(&self, id: TaskId, cancel: CancelFlag, permit: Permit) {
        if let Err(err) = self.execute(id, &cancel).await {
            tracing::error!(task_id = %id, error = %err, "pipeline run aborted on store error");
        }
        self.registry.remove(&id).await;
        drop(permit);
    }

    /// Mark a task cancelled without running it. Used when cancellation wins
    /// while the task is still queued.
    pub async fn abandon(&self, id: TaskId) {
        match self.advance(&id, &|t: &mut TaskRecord| t.mark_cancelled()).await {
            Ok(Advance::Advanced(_)) => self.events.emit(Event::cancelled(id)).await,
            Ok(Advance::Halted(_)) => {}
            // Deleted while queued; nothing left to finalize.
            Err(StoreError::NotFound(_)) => {}
            Err(err) => {
                tracing::error!(task_id = %id, error = %err, "failed to finalize queued cancellation");
            }
        }
        self.registry.remove(&id).await;
    }

    /// Settle a task that will never run because the engine is shutting
    /// down, so no record is left stuck in `pending`.
    pub async fn interrupt(&self, id: TaskId) {
        let failure = TaskFailure::interrupted();
        let recorded = failure.clone();
        match self
            .advance(&id, &move |t: &mut TaskRecord| t.mark_failed(recorded.clone()))
            .await
        {
            Ok(Advance::Advanced(_)) => self.events.emit(Event::failed(id, failure)).await,
            Ok(Advance::Halted(_)) | Err(StoreError::NotFound(_)) => {}
            Err(err) => {
                tracing::error!(task_id = %id, error = %err, "failed to settle task at shutdown");
            }
        }
        self.registry.remove(&id).await;
    }

    async fn execute(&self, id: TaskId, cancel: &CancelFlag) -> Result<(), StoreError> {
        if cancel.is_cancelled() {
            return self.finalize_cancelled(id).await;
        }

        // pending -> downloading
        match self.advance(&id, &|t: &mut TaskRecord| t.mark_downloading()).await? {
            Advance::Advanced(_) => {}
            Advance::Halted(_) => return Ok(()),
        }
        self.events.emit(Event::stage_started(id, "download")).await;

        let record = self.store.get(&id).await?;
        let (tx, persister) = self.progress_channel(id, DOWNLOAD_BASE, DOWNLOAD_SPAN);
        let downloaded = self
            .downloader
            .run(&record.source_ref, record.mode, tx, cancel)
            .await;
        let _ = persister.await;

        let downloaded = match downloaded {
            Ok(artifact) => artifact,
            Err(StageError::Cancelled) => return self.finalize_cancelled(id).await,
            Err(err) => return self.finalize_failed(id, "download", err).await,
        };

        // downloading -> processing. This CAS is the cancellation commit
        // point: if a concurrent cancel landed first, clean up and stop.
        match self.advance(&id, &|t: &mut TaskRecord| t.mark_processing()).await? {
            Advance::Advanced(_) => {}
            Advance::Halted(_) => {
                self.discard_download(downloaded.path()).await;
                return Ok(());
            }
        }
        self.events.emit(Event::stage_started(id, "transform")).await;

        // Past the commit point the run is not interruptible, so the
        // transform stage gets a flag that never fires.
        let inert = CancelFlag::new();
        let (tx, persister) = self.progress_channel(id, TRANSFORM_BASE, TRANSFORM_SPAN);
        let transformed = self
            .transformer
            .run(&downloaded.path().to_string_lossy(), record.mode, tx, &inert)
            .await;
        let _ = persister.await;

        self.discard_download(downloaded.path()).await;

        match transformed {
            Ok(artifact) => {
                let output = artifact.path().to_string_lossy().into_owned();
                match self
                    .advance(&id, &move |t: &mut TaskRecord| t.mark_completed(output.clone()))
                    .await?
                {
                    Advance::Advanced(record) => {
                        if let Some(output_ref) = record.output_ref {
                            self.events.emit(Event::completed(id, output_ref)).await;
                        }
                    }
                    Advance::Halted(_) => {
                        // Nothing will serve this artifact; do not leak it.
                        let _ = remove_artifact(artifact.path()).await;
                    }
                }
                Ok(())
            }
            Err(err) => self.finalize_failed(id, "transform", err).await,
        }
    }

    /// Apply a transition via compare-and-set, re-reading on conflicts.
    /// Stops without writing once the record is terminal.
    async fn advance(
        &self,
        id: &TaskId,
        mutate: &(dyn Fn(&mut TaskRecord) + Send + Sync),
    ) -> Result<Advance, StoreError> {
        loop {
            let current = self.store.get(id).await?;
            if current.status.is_terminal() {
                return Ok(Advance::Halted(current));
            }
            match self.store.update(id, current.version, mutate).await {
                Ok(record) => return Ok(Advance::Advanced(record)),
                // A concurrent writer bumped the version; re-read and retry.
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Spawn a task that maps stage-local progress (0-100) into the stage's
    /// slice of overall progress and persists it, rate-limited to writes of
    /// at least [`PROGRESS_STRIDE`] points.
    fn progress_channel(
        &self,
        id: TaskId,
        base: u8,
        span: u8,
    ) -> (ProgressSender, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<u8>();
        let store = Arc::clone(&self.store);
        let handle = tokio::spawn(async move {
            let mut last_written = base;
            while let Some(stage_pct) = rx.recv().await {
                let overall = base + (stage_pct.min(100) as u32 * span as u32 / 100) as u8;
                if overall < last_written.saturating_add(PROGRESS_STRIDE) {
                    continue;
                }
                match persist_progress(store.as_ref(), &id, overall).await {
                    Ok(()) => last_written = overall,
                    Err(err) => {
                        tracing::warn!(task_id = %id, error = %err, "progress write failed");
                    }
                }
            }
        });
        (tx, handle)
    }

    async fn finalize_cancelled(&self, id: TaskId) -> Result<(), StoreError> {
        match self.advance(&id, &|t: &mut TaskRecord| t.mark_cancelled()).await? {
            Advance::Advanced(_) => self.events.emit(Event::cancelled(id)).await,
            Advance::Halted(_) => {}
        }
        Ok(())
    }

    async fn finalize_failed(
        &self,
        id: TaskId,
        stage: &str,
        err: StageError,
    ) -> Result<(), StoreError> {
        let failure = TaskFailure::new(stage, err.to_string());
        let recorded = failure.clone();
        match self
            .advance(&id, &move |t: &mut TaskRecord| t.mark_failed(recorded.clone()))
            .await?
        {
            Advance::Advanced(_) => self.events.emit(Event::failed(id, failure)).await,
            Advance::Halted(_) => {}
        }
        Ok(())
    }

    /// Remove the downloaded intermediate and its annotation sidecar.
    async fn discard_download(&self, path: &std::path::Path) {
        let _ = remove_artifact(path).await;
        let _ = remove_artifact(&path.with_extension("srt")).await;
    }
}

/// Persist a progress value unless the task has already gone terminal.
async fn persist_progress(
    store: &dyn TaskStore,
    id: &TaskId,
    overall: u8,
) -> Result<(), StoreError> {
    loop {
        let current = store.get(id).await?;
        if current.status.is_terminal() {
            return Ok(());
        }
        match store
            .update(id, current.version, &|t: &mut TaskRecord| {
                t.set_progress(overall)
            })
            .await
        {
            Ok(_) => return Ok(()),
            Err(StoreError::VersionConflict { .. }) => continue,
            Err(err) => return Err(err),
        }
    }
}
