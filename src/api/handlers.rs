//! Request handlers.

use std::str::FromStr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::core::task::TaskStatus;
use crate::core::types::TaskId;
use crate::orchestrator::Orchestrator;
use crate::store::TaskFilter;

use super::errors::ApiError;
use super::responses::{HealthResponse, MessageResponse, TaskListResponse, TaskResponse};

/// Header identifying the requesting principal.
const OWNER_HEADER: &str = "x-user-id";

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

fn owner_from(headers: &HeaderMap) -> Result<String, ApiError> {
    let value = headers
        .get(OWNER_HEADER)
        .ok_or_else(|| ApiError::bad_request(format!("missing {OWNER_HEADER} header")))?;
    let owner = value
        .to_str()
        .map_err(|_| ApiError::bad_request(format!("invalid {OWNER_HEADER} header")))?;
    if owner.trim().is_empty() {
        return Err(ApiError::bad_request(format!(
            "empty {OWNER_HEADER} header"
        )));
    }
    Ok(owner.to_string())
}

fn parse_id(raw: &str) -> Result<TaskId, ApiError> {
    TaskId::from_str(raw).map_err(|_| ApiError::bad_request(format!("invalid task id: {raw}")))
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub source_ref: String,
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_mode() -> String {
    "plain".to_string()
}

#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn create_task(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = owner_from(&headers)?;
    let record = state
        .orchestrator
        .submit(&owner, &request.source_ref, &request.mode)
        .await?;
    Ok((StatusCode::CREATED, Json(TaskResponse::from(record))))
}

pub async fn list_tasks(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<TaskListResponse>, ApiError> {
    let owner = owner_from(&headers)?;

    let mut filter = TaskFilter::default();
    if let Some(raw) = &query.status {
        let status = TaskStatus::from_str(raw)
            .map_err(|err| ApiError::bad_request(err.to_string()))?;
        filter = filter.with_status(status);
    }
    if let Some(limit) = query.limit {
        filter = filter.with_limit(limit);
    }
    if let Some(offset) = query.offset {
        filter = filter.with_offset(offset);
    }

    let records = state.orchestrator.list(&owner, filter).await?;
    Ok(Json(TaskListResponse::new(records)))
}

pub async fn get_task(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let owner = owner_from(&headers)?;
    let id = parse_id(&id)?;
    let record = state.orchestrator.get(&owner, &id).await?;
    Ok(Json(TaskResponse::from(record)))
}

pub async fn cancel_task(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let owner = owner_from(&headers)?;
    let id = parse_id(&id)?;
    let record = state.orchestrator.cancel(&owner, &id).await?;
    Ok(Json(TaskResponse::from(record)))
}

pub async fn delete_task(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let owner = owner_from(&headers)?;
    let id = parse_id(&id)?;
    state.orchestrator.delete(&owner, &id).await?;
    Ok(Json(MessageResponse {
        message: format!("task {id} deleted"),
    }))
}

pub async fn download_artifact(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let owner = owner_from(&headers)?;
    let id = parse_id(&id)?;
    let path = state.orchestrator.artifact_path(&owner, &id).await?;

    let file = tokio::fs::File::open(&path).await.map_err(|err| {
        tracing::error!(task_id = %id, path = %path.display(), error = %err, "artifact missing on disk");
        ApiError::internal()
    })?;

    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{id}.mp4"));
    let body = Body::from_stream(ReaderStream::new(file));

    Ok((
        [
            (header::CONTENT_TYPE, "video/mp4".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response())
}
