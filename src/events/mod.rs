//! Lifecycle event notifications.
//!
//! The engine emits an [`Event`] at each significant lifecycle edge and fans
//! it out to registered [`EventHandler`]s. Handlers are fire-and-forget
//! observers: they cannot veto or reorder transitions, and a slow handler
//! only delays other handlers, never the pipeline itself.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::SystemTime;

use crate::core::task::TaskFailure;
use crate::core::types::TaskId;

/// A lifecycle notification emitted by the engine.
#[derive(Debug, Clone)]
pub enum Event {
    /// A task was accepted and persisted as pending.
    TaskSubmitted {
        task_id: TaskId,
        owner: String,
        timestamp: SystemTime,
    },
    /// A pipeline stage began executing.
    StageStarted {
        task_id: TaskId,
        stage: String,
        timestamp: SystemTime,
    },
    /// The task produced its artifact.
    TaskCompleted {
        task_id: TaskId,
        output_ref: String,
        timestamp: SystemTime,
    },
    /// The task ended in failure.
    TaskFailed {
        task_id: TaskId,
        failure: TaskFailure,
        timestamp: SystemTime,
    },
    /// The task was cancelled before the commit point.
    TaskCancelled {
        task_id: TaskId,
        timestamp: SystemTime,
    },
}

impl Event {
    pub fn submitted(task_id: TaskId, owner: impl Into<String>) -> Self {
        Event::TaskSubmitted {
            task_id,
            owner: owner.into(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn stage_started(task_id: TaskId, stage: impl Into<String>) -> Self {
        Event::StageStarted {
            task_id,
            stage: stage.into(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn completed(task_id: TaskId, output_ref: impl Into<String>) -> Self {
        Event::TaskCompleted {
            task_id,
            output_ref: output_ref.into(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn failed(task_id: TaskId, failure: TaskFailure) -> Self {
        Event::TaskFailed {
            task_id,
            failure,
            timestamp: SystemTime::now(),
        }
    }

    pub fn cancelled(task_id: TaskId) -> Self {
        Event::TaskCancelled {
            task_id,
            timestamp: SystemTime::now(),
        }
    }

    /// The task this event concerns.
    pub fn task_id(&self) -> TaskId {
        match self {
            Event::TaskSubmitted { task_id, .. }
            | Event::StageStarted { task_id, .. }
            | Event::TaskCompleted { task_id, .. }
            | Event::TaskFailed { task_id, .. }
            | Event::TaskCancelled { task_id, .. } => *task_id,
        }
    }

    /// When the event occurred.
    pub fn timestamp(&self) -> SystemTime {
        match self {
            Event::TaskSubmitted { timestamp, .. }
            | Event::StageStarted { timestamp, .. }
            | Event::TaskCompleted { timestamp, .. }
            | Event::TaskFailed { timestamp, .. }
            | Event::TaskCancelled { timestamp, .. } => *timestamp,
        }
    }
}

/// Observer of engine lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event);
}

/// Fans events out to every registered handler, in registration order.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventBus {
    /// Create a bus with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Handlers are invoked in registration order.
    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Deliver an event to every handler.
    pub async fn emit(&self, event: Event) {
        for handler in &self.handlers {
            handler.handle(&event).await;
        }
    }
}

/// Handler that mirrors events into the tracing log.
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::TaskSubmitted { task_id, owner, .. } => {
                tracing::info!(task_id = %task_id, owner = %owner, "task submitted");
            }
            Event::StageStarted { task_id, stage, .. } => {
                tracing::info!(task_id = %task_id, stage = %stage, "stage started");
            }
            Event::TaskCompleted {
                task_id, output_ref, ..
            } => {
                tracing::info!(task_id = %task_id, output_ref = %output_ref, "task completed");
            }
            Event::TaskFailed {
                task_id, failure, ..
            } => {
                tracing::warn!(task_id = %task_id, stage = %failure.stage, error = %failure.message, "task failed");
            }
            Event::TaskCancelled { task_id, .. } => {
                tracing::info!(task_id = %task_id, "task cancelled");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: &Event) {
            let label = match event {
                Event::TaskSubmitted { .. } => "submitted",
                Event::StageStarted { stage, .. } => match stage.as_str() {
                    "download" => "download-started",
                    _ => "transform-started",
                },
                Event::TaskCompleted { .. } => "completed",
                Event::TaskFailed { .. } => "failed",
                Event::TaskCancelled { .. } => "cancelled",
            };
            self.seen.lock().unwrap().push(label.to_string());
        }
    }

    #[tokio::test]
    async fn test_bus_delivers_to_all_handlers_in_order() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let mut bus = EventBus::new();
        bus.register(recorder.clone());
        bus.register(recorder.clone());

        let id = TaskId::new();
        bus.emit(Event::submitted(id, "u1")).await;
        bus.emit(Event::stage_started(id, "download")).await;
        bus.emit(Event::completed(id, "artifacts/out.mp4")).await;

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                "submitted",
                "submitted",
                "download-started",
                "download-started",
                "completed",
                "completed"
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_bus_is_a_no_op() {
        let bus = EventBus::new();
        bus.emit(Event::cancelled(TaskId::new())).await;
    }

    #[test]
    fn test_event_accessors() {
        let id = TaskId::new();
        let event = Event::failed(id, TaskFailure::new("download", "gone"));
        assert_eq!(event.task_id(), id);
        assert!(event.timestamp() <= SystemTime::now());
    }
}
