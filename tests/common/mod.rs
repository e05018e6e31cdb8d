//! Shared fixtures for integration tests.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use clipflow::pipeline::CancelFlag;
use clipflow::stage::ProgressSender;
use clipflow::{
    ArtifactRef, EventBus, MemoryStore, Orchestrator, OrchestratorConfig, ProcessingMode,
    StageError, StageExecutor, TaskId, TaskStatus,
};

/// Scripted stage executor.
///
/// By default it succeeds instantly, writing a small artifact into its own
/// scratch directory. Tests can make it fail, or gate completion on permits
/// released by the test body so concurrency and cancellation windows become
/// deterministic.
pub struct StubStage {
    scratch: TempDir,
    fail_with: Option<String>,
    gate: Option<Arc<Semaphore>>,
    started: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl StubStage {
    pub fn succeeding() -> Self {
        Self {
            scratch: tempfile::tempdir().unwrap(),
            fail_with: None,
            gate: None,
            started: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        let mut stage = Self::succeeding();
        stage.fail_with = Some(message.into());
        stage
    }

    /// Block each run until the test releases a permit on the returned
    /// semaphore.
    pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    /// How many runs have started.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// The largest number of runs observed in flight at once.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageExecutor for StubStage {
    async fn run(
        &self,
        _source_ref: &str,
        _mode: ProcessingMode,
        progress: ProgressSender,
        cancel: &CancelFlag,
    ) -> Result<ArtifactRef, StageError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        let result = async {
            if let Some(gate) = &self.gate {
                tokio::select! {
                    permit = gate.acquire() => {
                        permit.map_err(|_| StageError::Cancelled)?.forget();
                    }
                    _ = cancel.cancelled() => return Err(StageError::Cancelled),
                }
            }
            if let Some(message) = &self.fail_with {
                return Err(StageError::BadSource(message.clone()));
            }

            let _ = progress.send(50);
            let _ = progress.send(100);

            let path = self.scratch.path().join(format!("{}.mp4", TaskId::new()));
            tokio::fs::write(&path, b"stub media").await?;
            Ok(ArtifactRef::new(path))
        }
        .await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// A running engine over an in-memory store, with scripted stages.
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<MemoryStore>,
    pub dirs: TempDir,
}

pub async fn start_engine(
    downloader: Arc<dyn StageExecutor>,
    transformer: Arc<dyn StageExecutor>,
    max_concurrent: usize,
) -> Harness {
    let dirs = tempfile::tempdir().unwrap();
    let config = OrchestratorConfig::default()
        .with_max_concurrent_runs(max_concurrent)
        .with_sweep_interval(Duration::from_secs(3600))
        .with_artifact_dir(dirs.path().join("artifacts"))
        .with_work_dir(dirs.path().join("work"));

    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::start(
        config,
        store.clone(),
        downloader,
        transformer,
        EventBus::new(),
    )
    .await
    .unwrap();

    Harness {
        orchestrator,
        store,
        dirs,
    }
}

/// Engine whose stages always succeed immediately.
pub async fn quick_engine(max_concurrent: usize) -> Harness {
    start_engine(
        Arc::new(StubStage::succeeding()),
        Arc::new(StubStage::succeeding()),
        max_concurrent,
    )
    .await
}

/// Poll until the task reaches `expected`, panicking after `timeout`.
pub async fn wait_for_status(
    orchestrator: &Orchestrator,
    owner: &str,
    id: &TaskId,
    expected: TaskStatus,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let record = orchestrator.get(owner, id).await.unwrap();
        if record.status == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {id} stuck in {:?} waiting for {:?}",
            record.status,
            expected
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
