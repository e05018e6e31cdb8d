//! Submission queue and dispatcher.
//!
//! Submissions are handed to a single dispatcher task over an unbounded
//! channel. The dispatcher acquires an admission slot for the head of the
//! queue before spawning its run, which keeps admission strictly first-come
//! first-served: nobody behind the head can overtake it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::types::TaskId;

use super::cancel::CancelFlag;
use super::gate::{AdmissionGate, GateError};
use super::runner::PipelineRunner;

/// One queued pipeline run.
pub struct RunRequest {
    pub task_id: TaskId,
    pub cancel: CancelFlag,
}

/// Handle for enqueueing pipeline runs.
#[derive(Clone)]
pub struct WorkerPool {
    tx: mpsc::UnboundedSender<RunRequest>,
}

impl WorkerPool {
    /// Spawn the dispatcher and return the submission handle.
    pub fn start(gate: Arc<AdmissionGate>, runner: Arc<PipelineRunner>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(rx, gate, runner));
        Self { tx }
    }

    /// Enqueue a run. Fails only if the dispatcher has shut down.
    pub fn submit(&self, request: RunRequest) -> Result<(), PoolClosed> {
        self.tx.send(request).map_err(|_| PoolClosed)
    }
}

/// The dispatcher is gone and no further runs can start.
#[derive(Debug, thiserror::Error)]
#[error("worker pool is shut down")]
pub struct PoolClosed;

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<RunRequest>,
    gate: Arc<AdmissionGate>,
    runner: Arc<PipelineRunner>,
) {
    while let Some(request) = rx.recv().await {
        // Waiting here, not in the spawned run, is what preserves FIFO
        // admission across the whole queue.
        let permit = match gate.acquire(&request.cancel).await {
            Ok(permit) => permit,
            Err(GateError::Cancelled) => {
                runner.abandon(request.task_id).await;
                continue;
            }
            Err(GateError::Closed) => {
                // Refuse new submissions, then settle everything already
                // queued before stopping.
                rx.close();
                runner.interrupt(request.task_id).await;
                while let Some(queued) = rx.recv().await {
                    runner.interrupt(queued.task_id).await;
                }
                break;
            }
        };

        let runner = Arc::clone(&runner);
        let _run: JoinHandle<()> = tokio::spawn(async move {
            runner.run(request.task_id, request.cancel, permit).await;
        });
    }
    tracing::debug!("pipeline dispatcher stopped");
}
