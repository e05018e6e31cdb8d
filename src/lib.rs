//! clipflow: a single-node orchestrator for asynchronous media-processing
//! tasks.
//!
//! Callers submit a source reference plus a processing mode and poll the
//! resulting task as it moves through a two-stage pipeline (acquire, then
//! transform). The engine bounds concurrent runs with a FIFO admission gate,
//! persists every state transition through an optimistic-concurrency store,
//! honours cancellation up to a commit point, and reaps terminal tasks once
//! their retention window lapses.

pub mod api;
pub mod config;
pub mod core;
pub mod events;
pub mod orchestrator;
pub mod pipeline;
pub mod reaper;
pub mod stage;
pub mod store;

pub use crate::core::task::{ProcessingMode, TaskFailure, TaskRecord, TaskStatus};
pub use crate::core::types::TaskId;
pub use config::OrchestratorConfig;
pub use events::{Event, EventBus, EventHandler, LoggingHandler};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use reaper::RetentionReaper;
pub use stage::{ArtifactRef, CommandDownloader, CommandTransformer, StageError, StageExecutor};
pub use store::{MemoryStore, SqliteStore, StoreError, TaskFilter, TaskStore};
