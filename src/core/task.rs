//! The task entity and its lifecycle state machine.
//!
//! A [`TaskRecord`] is the unit of work: one submitted processing request and
//! everything tracked about it. Records are mutated through the `mark_*`
//! methods so every transition keeps the record's invariants (progress bounds,
//! output/error exclusivity, completion timestamps).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use crate::core::types::TaskId;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, waiting for an admission slot.
    Pending,
    /// Acquisition stage is running.
    Downloading,
    /// Transform stage is running. Past the cancellation commit point.
    Processing,
    /// Terminal: artifact produced.
    Completed,
    /// Terminal: a stage reported failure.
    Failed,
    /// Terminal: cancelled before the commit point.
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the task is still somewhere in the pipeline.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether a cancellation request can still be honored.
    ///
    /// `processing` is past the commit point: the run goes to a terminal
    /// outcome and cancellation is rejected rather than silently ignored.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Downloading)
    }

    /// Whether `next` is a legal transition from this state.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Downloading, Processing)
                | (Downloading, Failed)
                | (Downloading, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    /// Stable string form, used in storage and the API.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "downloading" => Ok(TaskStatus::Downloading),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(UnknownVariant {
                kind: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Processing mode applied to the source media. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingMode {
    /// Pass the source through unchanged (container normalization only).
    Plain,
    /// Burn the annotation track into the video.
    Annotated,
    /// Play twice: first pass plain, second pass annotated.
    Repeated,
    /// Slow playback with annotations.
    ReducedSpeed,
}

impl ProcessingMode {
    /// Stable string form, used in storage and the API.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMode::Plain => "plain",
            ProcessingMode::Annotated => "annotated",
            ProcessingMode::Repeated => "repeated",
            ProcessingMode::ReducedSpeed => "reduced-speed",
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(ProcessingMode::Plain),
            "annotated" => Ok(ProcessingMode::Annotated),
            "repeated" => Ok(ProcessingMode::Repeated),
            "reduced-speed" => Ok(ProcessingMode::ReducedSpeed),
            other => Err(UnknownVariant {
                kind: "mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Parse error for the closed string enums above.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Structured failure recorded on a task, naming which stage failed and why.
///
/// This is what polling callers see; it deliberately carries no internal
/// detail beyond the stage name and a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Stage that reported the failure ("download", "transform", or
    /// "orchestrator" for restart recovery).
    pub stage: String,
    /// Human-readable description.
    pub message: String,
}

impl TaskFailure {
    /// Create a failure description for the given stage.
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// The failure recorded on tasks found mid-flight after a restart.
    pub fn interrupted() -> Self {
        Self::new("orchestrator", "interrupted by restart")
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed: {}", self.stage, self.message)
    }
}

/// One submitted processing request and its tracked lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique identifier, assigned at creation.
    pub id: TaskId,
    /// Identifier of the requesting principal.
    pub owner: String,
    /// Opaque reference to the input media (URL or source-id).
    pub source_ref: String,
    /// Processing mode to apply.
    pub mode: ProcessingMode,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Completion percentage, 0-100, monotone within a run.
    pub progress: u8,
    /// Name of the current/last stage. Diagnostic only.
    pub stage_label: Option<String>,
    /// When the task was created.
    pub created_at: SystemTime,
    /// When the task was last mutated.
    pub updated_at: SystemTime,
    /// When the task reached a terminal state.
    pub completed_at: Option<SystemTime>,
    /// Pointer to the produced artifact. Set only on terminal success.
    pub output_ref: Option<String>,
    /// Failure description. Set only on terminal failure.
    pub error: Option<TaskFailure>,
    /// Optimistic-concurrency counter, incremented by the store on every
    /// persisted mutation.
    pub version: u64,
}

impl TaskRecord {
    /// Create a new pending task.
    pub fn new(owner: impl Into<String>, source_ref: impl Into<String>, mode: ProcessingMode) -> Self {
        let now = SystemTime::now();
        Self {
            id: TaskId::new(),
            owner: owner.into(),
            source_ref: source_ref.into(),
            mode,
            status: TaskStatus::Pending,
            progress: 0,
            stage_label: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            output_ref: None,
            error: None,
            version: 1,
        }
    }

    fn transition(&mut self, next: TaskStatus) {
        debug_assert!(
            self.status.can_transition_to(next),
            "illegal transition: {} -> {}",
            self.status,
            next
        );
        self.status = next;
    }

    /// Enter the acquisition stage.
    pub fn mark_downloading(&mut self) {
        self.transition(TaskStatus::Downloading);
        self.progress = 5;
        self.stage_label = Some("download".to_string());
    }

    /// Enter the transform stage. This is the cancellation commit point.
    pub fn mark_processing(&mut self) {
        self.transition(TaskStatus::Processing);
        self.progress = self.progress.max(40);
        self.stage_label = Some("transform".to_string());
    }

    /// Terminal success: record the artifact.
    pub fn mark_completed(&mut self, output_ref: impl Into<String>) {
        self.transition(TaskStatus::Completed);
        self.progress = 100;
        self.output_ref = Some(output_ref.into());
        self.completed_at = Some(SystemTime::now());
    }

    /// Terminal failure: record which stage failed and why.
    pub fn mark_failed(&mut self, failure: TaskFailure) {
        self.transition(TaskStatus::Failed);
        self.error = Some(failure);
        self.output_ref = None;
        self.completed_at = Some(SystemTime::now());
    }

    /// Terminal cancellation.
    pub fn mark_cancelled(&mut self) {
        self.transition(TaskStatus::Cancelled);
        self.completed_at = Some(SystemTime::now());
    }

    /// Raise progress to `percent`, clamped to [0,100] and never decreasing.
    pub fn set_progress(&mut self, percent: u8) {
        self.progress = self.progress.max(percent.min(100));
    }
}
