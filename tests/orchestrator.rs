//! End-to-end behavior of the orchestrator facade.

mod common;

use std::sync::Arc;
use std::time::Duration;

use clipflow::store::update_task;
use clipflow::{
    EventBus, MemoryStore, Orchestrator, OrchestratorConfig, OrchestratorError, ProcessingMode,
    TaskFilter, TaskRecord, TaskStatus, TaskStore,
};

use common::{quick_engine, start_engine, wait_for_status, StubStage};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_submitted_task_runs_to_completion() {
    let engine = quick_engine(2).await;

    let task = engine
        .orchestrator
        .submit("u1", "https://example.com/v1", "plain")
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.progress, 0);

    wait_for_status(&engine.orchestrator, "u1", &task.id, TaskStatus::Completed, WAIT).await;

    let done = engine.orchestrator.get("u1", &task.id).await.unwrap();
    assert_eq!(done.progress, 100);
    assert!(done.completed_at.is_some());
    let output = done.output_ref.expect("completed task has an artifact");
    assert!(std::path::Path::new(&output).exists());
}

#[tokio::test]
async fn test_concurrency_never_exceeds_the_gate_capacity() {
    let (downloader, release) = StubStage::succeeding().gated();
    let downloader = Arc::new(downloader);
    let transformer = Arc::new(StubStage::succeeding());
    let engine = start_engine(downloader.clone(), transformer.clone(), 2).await;

    let mut ids = Vec::new();
    for i in 0..5 {
        let task = engine
            .orchestrator
            .submit("u1", &format!("https://example.com/v{i}"), "plain")
            .await
            .unwrap();
        ids.push(task.id);
    }

    // Let the dispatcher admit as much as it is willing to.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(downloader.started(), 2);

    release.add_permits(5);
    for id in &ids {
        wait_for_status(&engine.orchestrator, "u1", id, TaskStatus::Completed, WAIT).await;
    }

    assert_eq!(downloader.started(), 5);
    assert!(downloader.max_running() <= 2);
    assert!(transformer.max_running() <= 2);
}

#[tokio::test]
async fn test_queued_tasks_are_admitted_in_submission_order() {
    let (downloader, release) = StubStage::succeeding().gated();
    let downloader = Arc::new(downloader);
    let engine = start_engine(downloader.clone(), Arc::new(StubStage::succeeding()), 1).await;

    let first = engine.orchestrator.submit("u1", "v1", "plain").await.unwrap();
    let second = engine.orchestrator.submit("u1", "v2", "plain").await.unwrap();
    let third = engine.orchestrator.submit("u1", "v3", "plain").await.unwrap();

    wait_for_status(&engine.orchestrator, "u1", &first.id, TaskStatus::Downloading, WAIT).await;
    assert_eq!(downloader.started(), 1);

    release.add_permits(1);
    wait_for_status(&engine.orchestrator, "u1", &first.id, TaskStatus::Completed, WAIT).await;
    wait_for_status(&engine.orchestrator, "u1", &second.id, TaskStatus::Downloading, WAIT).await;

    // The head of the queue got the freed slot; the last submission is still
    // waiting.
    let waiting = engine.orchestrator.get("u1", &third.id).await.unwrap();
    assert_eq!(waiting.status, TaskStatus::Pending);

    release.add_permits(2);
    wait_for_status(&engine.orchestrator, "u1", &second.id, TaskStatus::Completed, WAIT).await;
    wait_for_status(&engine.orchestrator, "u1", &third.id, TaskStatus::Completed, WAIT).await;
}

#[tokio::test]
async fn test_cancelling_a_queued_task_skips_its_run() {
    let (downloader, release) = StubStage::succeeding().gated();
    let downloader = Arc::new(downloader);
    let engine = start_engine(downloader.clone(), Arc::new(StubStage::succeeding()), 1).await;

    let running = engine.orchestrator.submit("u1", "v1", "plain").await.unwrap();
    let queued = engine.orchestrator.submit("u1", "v2", "plain").await.unwrap();
    wait_for_status(&engine.orchestrator, "u1", &running.id, TaskStatus::Downloading, WAIT).await;

    let cancelled = engine.orchestrator.cancel("u1", &queued.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    release.add_permits(1);
    wait_for_status(&engine.orchestrator, "u1", &running.id, TaskStatus::Completed, WAIT).await;

    // Only the first task's download ever started.
    assert_eq!(downloader.started(), 1);
}

#[tokio::test]
async fn test_cancelling_during_download_aborts_the_run() {
    let (downloader, _release) = StubStage::succeeding().gated();
    let engine = start_engine(Arc::new(downloader), Arc::new(StubStage::succeeding()), 1).await;

    let task = engine.orchestrator.submit("u1", "v1", "plain").await.unwrap();
    wait_for_status(&engine.orchestrator, "u1", &task.id, TaskStatus::Downloading, WAIT).await;

    let cancelled = engine.orchestrator.cancel("u1", &task.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());
    assert!(cancelled.output_ref.is_none());
}

#[tokio::test]
async fn test_cancel_is_rejected_past_the_commit_point() {
    let (transformer, release) = StubStage::succeeding().gated();
    let engine = start_engine(Arc::new(StubStage::succeeding()), Arc::new(transformer), 1).await;

    let task = engine.orchestrator.submit("u1", "v1", "plain").await.unwrap();
    wait_for_status(&engine.orchestrator, "u1", &task.id, TaskStatus::Processing, WAIT).await;

    let err = engine.orchestrator.cancel("u1", &task.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Conflict(_)));

    release.add_permits(1);
    wait_for_status(&engine.orchestrator, "u1", &task.id, TaskStatus::Completed, WAIT).await;
}

#[tokio::test]
async fn test_cancel_is_rejected_on_terminal_tasks() {
    let engine = quick_engine(1).await;

    let task = engine.orchestrator.submit("u1", "v1", "plain").await.unwrap();
    wait_for_status(&engine.orchestrator, "u1", &task.id, TaskStatus::Completed, WAIT).await;
    let before = engine.orchestrator.get("u1", &task.id).await.unwrap();

    let err = engine.orchestrator.cancel("u1", &task.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Conflict(_)));

    // The rejected cancellation left the record untouched.
    let after = engine.orchestrator.get("u1", &task.id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Completed);
    assert_eq!(after.version, before.version);
    assert_eq!(after.output_ref, before.output_ref);
}

#[tokio::test]
async fn test_download_failure_is_reported_with_its_stage() {
    let engine = start_engine(
        Arc::new(StubStage::failing("unreachable source")),
        Arc::new(StubStage::succeeding()),
        2,
    )
    .await;

    let task = engine.orchestrator.submit("u1", "v1", "plain").await.unwrap();
    wait_for_status(&engine.orchestrator, "u1", &task.id, TaskStatus::Failed, WAIT).await;

    let failed = engine.orchestrator.get("u1", &task.id).await.unwrap();
    let failure = failed.error.expect("failed task carries an error");
    assert_eq!(failure.stage, "download");
    assert!(failure.message.contains("unreachable source"));
    assert!(failed.output_ref.is_none());
}

#[tokio::test]
async fn test_transform_failure_is_reported_with_its_stage() {
    let engine = start_engine(
        Arc::new(StubStage::succeeding()),
        Arc::new(StubStage::failing("encoder exploded")),
        2,
    )
    .await;

    let task = engine.orchestrator.submit("u1", "v1", "annotated").await.unwrap();
    wait_for_status(&engine.orchestrator, "u1", &task.id, TaskStatus::Failed, WAIT).await;

    let failed = engine.orchestrator.get("u1", &task.id).await.unwrap();
    assert_eq!(failed.error.unwrap().stage, "transform");
    assert!(failed.progress < 100);
}

#[tokio::test]
async fn test_submission_validation() {
    let engine = quick_engine(1).await;

    let err = engine.orchestrator.submit("u1", "", "plain").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    let err = engine.orchestrator.submit("", "v1", "plain").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    let err = engine
        .orchestrator
        .submit("u1", "v1", "karaoke")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(message) if message.contains("karaoke")));

    // Rejected submissions create no task.
    let tasks = engine
        .orchestrator
        .list("u1", TaskFilter::default())
        .await
        .unwrap();
    assert!(tasks.is_empty());
}

#[tokio::test]
async fn test_tasks_are_scoped_to_their_owner() {
    let engine = quick_engine(2).await;
    let task = engine.orchestrator.submit("alice", "v1", "plain").await.unwrap();
    wait_for_status(&engine.orchestrator, "alice", &task.id, TaskStatus::Completed, WAIT).await;

    let err = engine.orchestrator.get("mallory", &task.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Forbidden(_)));

    let err = engine.orchestrator.cancel("mallory", &task.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Forbidden(_)));

    let err = engine.orchestrator.delete("mallory", &task.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Forbidden(_)));

    // Listing only surfaces the caller's own tasks.
    let mine = engine
        .orchestrator
        .list("alice", TaskFilter::default())
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);
    let theirs = engine
        .orchestrator
        .list("mallory", TaskFilter::default())
        .await
        .unwrap();
    assert!(theirs.is_empty());
}

#[tokio::test]
async fn test_delete_requires_a_terminal_task_and_removes_the_artifact() {
    let (downloader, release) = StubStage::succeeding().gated();
    let engine = start_engine(Arc::new(downloader), Arc::new(StubStage::succeeding()), 1).await;

    let task = engine.orchestrator.submit("u1", "v1", "plain").await.unwrap();
    wait_for_status(&engine.orchestrator, "u1", &task.id, TaskStatus::Downloading, WAIT).await;

    let err = engine.orchestrator.delete("u1", &task.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Conflict(_)));

    release.add_permits(1);
    wait_for_status(&engine.orchestrator, "u1", &task.id, TaskStatus::Completed, WAIT).await;

    let output = engine
        .orchestrator
        .get("u1", &task.id)
        .await
        .unwrap()
        .output_ref
        .unwrap();
    assert!(std::path::Path::new(&output).exists());

    engine.orchestrator.delete("u1", &task.id).await.unwrap();
    assert!(!std::path::Path::new(&output).exists());
    let err = engine.orchestrator.get("u1", &task.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn test_artifact_path_is_only_served_for_completed_tasks() {
    let (downloader, release) = StubStage::succeeding().gated();
    let engine = start_engine(Arc::new(downloader), Arc::new(StubStage::succeeding()), 1).await;

    let task = engine.orchestrator.submit("u1", "v1", "plain").await.unwrap();
    let err = engine
        .orchestrator
        .artifact_path("u1", &task.id)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Conflict(_)));

    release.add_permits(1);
    wait_for_status(&engine.orchestrator, "u1", &task.id, TaskStatus::Completed, WAIT).await;

    let path = engine.orchestrator.artifact_path("u1", &task.id).await.unwrap();
    assert!(path.exists());
}

#[tokio::test]
async fn test_restart_recovery_fails_interrupted_tasks() {
    let store = Arc::new(MemoryStore::new());

    let interrupted = TaskRecord::new("u1", "v1", ProcessingMode::Plain);
    let interrupted_id = interrupted.id;
    store.create(interrupted).await.unwrap();
    update_task(store.as_ref(), &interrupted_id, |t| {
        t.mark_downloading();
        t.set_progress(20);
    })
    .await
    .unwrap();

    let dirs = tempfile::tempdir().unwrap();
    let config = OrchestratorConfig::default()
        .with_artifact_dir(dirs.path().join("artifacts"))
        .with_work_dir(dirs.path().join("work"));
    let orchestrator = Orchestrator::start(
        config,
        store.clone(),
        Arc::new(StubStage::succeeding()),
        Arc::new(StubStage::succeeding()),
        EventBus::new(),
    )
    .await
    .unwrap();

    let record = orchestrator.get("u1", &interrupted_id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    let failure = record.error.unwrap();
    assert_eq!(failure.stage, "orchestrator");
    assert!(failure.message.contains("restart"));
}

#[tokio::test]
async fn test_shutdown_settles_submissions_instead_of_stranding_them() {
    let engine = quick_engine(1).await;
    engine.orchestrator.shutdown();

    // Submissions keep being accepted until the dispatcher notices the
    // closed gate; after that they are refused outright.
    let mut accepted = Vec::new();
    let mut refused = false;
    for i in 0..50 {
        match engine
            .orchestrator
            .submit("u1", &format!("https://example.com/v{i}"), "plain")
            .await
        {
            Ok(task) => accepted.push(task.id),
            Err(OrchestratorError::Pool(_)) => {
                refused = true;
                break;
            }
            Err(other) => panic!("unexpected submit error: {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(refused, "submissions were never refused after shutdown");

    // Nothing is left pending: every accepted task settles as failed.
    for id in &accepted {
        wait_for_status(&engine.orchestrator, "u1", id, TaskStatus::Failed, WAIT).await;
        let record = engine.orchestrator.get("u1", id).await.unwrap();
        assert_eq!(record.error.unwrap().stage, "orchestrator");
    }
}

#[tokio::test]
async fn test_progress_hits_the_milestones() {
    let (transformer, release) = StubStage::succeeding().gated();
    let engine = start_engine(Arc::new(StubStage::succeeding()), Arc::new(transformer), 1).await;

    let task = engine.orchestrator.submit("u1", "v1", "repeated").await.unwrap();
    wait_for_status(&engine.orchestrator, "u1", &task.id, TaskStatus::Processing, WAIT).await;

    let processing = engine.orchestrator.get("u1", &task.id).await.unwrap();
    assert!(processing.progress >= 40);
    assert_eq!(processing.stage_label.as_deref(), Some("transform"));

    release.add_permits(1);
    wait_for_status(&engine.orchestrator, "u1", &task.id, TaskStatus::Completed, WAIT).await;
    let done = engine.orchestrator.get("u1", &task.id).await.unwrap();
    assert_eq!(done.progress, 100);
}
