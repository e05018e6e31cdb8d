//! JSON response bodies.

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::task::{TaskFailure, TaskRecord};

fn millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One task, as presented to API callers.
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: String,
    pub source_ref: String,
    pub mode: String,
    pub status: String,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
    /// Present only once the artifact is ready to fetch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl From<TaskRecord> for TaskResponse {
    fn from(record: TaskRecord) -> Self {
        let download_url = record
            .output_ref
            .is_some()
            .then(|| format!("/tasks/{}/download", record.id));
        Self {
            id: record.id.to_string(),
            source_ref: record.source_ref,
            mode: record.mode.to_string(),
            status: record.status.to_string(),
            progress: record.progress,
            stage: record.stage_label,
            created_at: millis(record.created_at),
            updated_at: millis(record.updated_at),
            completed_at: record.completed_at.map(millis),
            error: record.error,
            download_url,
        }
    }
}

/// A page of tasks.
#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskResponse>,
    pub count: usize,
}

impl TaskListResponse {
    pub fn new(records: Vec<TaskRecord>) -> Self {
        let tasks: Vec<TaskResponse> = records.into_iter().map(TaskResponse::from).collect();
        let count = tasks.len();
        Self { tasks, count }
    }
}

/// Liveness probe body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Plain acknowledgement body.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}
