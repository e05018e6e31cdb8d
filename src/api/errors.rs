//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::orchestrator::OrchestratorError;

/// An error ready to be rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Validation(message) => {
                ApiError::new(StatusCode::BAD_REQUEST, message)
            }
            OrchestratorError::NotFound(id) => {
                ApiError::new(StatusCode::NOT_FOUND, format!("task not found: {id}"))
            }
            OrchestratorError::Forbidden(_) => {
                ApiError::new(StatusCode::FORBIDDEN, "task belongs to a different owner")
            }
            OrchestratorError::Conflict(message) => ApiError::new(StatusCode::CONFLICT, message),
            OrchestratorError::Pool(_) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "engine is shutting down")
            }
            OrchestratorError::Store(err) => {
                tracing::error!(error = %err, "storage failure serving request");
                ApiError::internal()
            }
            OrchestratorError::Io(err) => {
                tracing::error!(error = %err, "filesystem failure serving request");
                ApiError::internal()
            }
        }
    }
}
