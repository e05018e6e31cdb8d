//! HTTP surface over the orchestrator.
//!
//! Routes:
//!   POST   /tasks                 submit a task
//!   GET    /tasks                 list the caller's tasks
//!   GET    /tasks/{id}            poll one task
//!   POST   /tasks/{id}/cancel     request cancellation
//!   DELETE /tasks/{id}            delete a terminal task
//!   GET    /tasks/{id}/download   fetch the artifact
//!   GET    /health                liveness probe
//!
//! The caller is identified by the `x-user-id` header on every task route.

mod errors;
mod handlers;
mod responses;

pub use errors::ApiError;
pub use handlers::ApiState;
pub use responses::{HealthResponse, TaskListResponse, TaskResponse};

use axum::routing::{delete, get, post};
use axum::Router;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Assemble the router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/tasks", post(handlers::create_task))
        .route("/tasks", get(handlers::list_tasks))
        .route("/tasks/{id}", get(handlers::get_task))
        .route("/tasks/{id}", delete(handlers::delete_task))
        .route("/tasks/{id}/cancel", post(handlers::cancel_task))
        .route("/tasks/{id}/download", get(handlers::download_artifact))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn start_server(addr: SocketAddr, state: ApiState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "api listening");
    axum::serve(listener, build_router(state)).await
}
