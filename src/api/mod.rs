//! Axum-based administration API.
//!
//! Provides:
//!   GET    /targets                  → JSON list of targets
//!   POST   /targets                  → add a target (201, prepared in the background)
//!   GET    /targets/{id}             → one target or 404
//!   DELETE /targets/{id}             → remove a target
//!   POST   /targets/{id}/activate    → ready | paused → active
//!   POST   /targets/{id}/deactivate  → active → paused
//!   POST   /targets/{id}/prepare     → rerun the prepare step of a pending target
//!   POST   /targets/{id}/retry       → error → pending → prepare
//!   GET    /status                   → orchestrator status report
//!   GET    /health                   → liveness

use crate::registry::RegistryError;
use crate::scheduler::{OrchestratorError, OrchestratorHandle};
use crate::target::{AddTarget, TargetId};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tracing::{info, warn};

/// Shared state for the API routes.
#[derive(Clone)]
pub struct ApiState {
    pub handle: OrchestratorHandle,
}

/// Build the Axum router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/targets", get(list_targets).post(add_target))
        .route("/targets/{id}", get(get_target).delete(remove_target))
        .route("/targets/{id}/activate", post(activate_target))
        .route("/targets/{id}/deactivate", post(deactivate_target))
        .route("/targets/{id}/prepare", post(prepare_target))
        .route("/targets/{id}/retry", post(retry_target))
        .route("/status", get(status))
        .route("/health", get(health))
        .with_state(state)
}

/// Start the API server.
pub async fn serve(state: ApiState, bind_addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "admin api listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Error body: `{"error": "..."}`.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let status = match &err {
            OrchestratorError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
            OrchestratorError::Registry(_) => StatusCode::CONFLICT,
            OrchestratorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "api request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

// --- Handlers ---

async fn list_targets(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let targets = state.handle.list().await?;
    Ok(Json(targets).into_response())
}

async fn add_target(
    State(state): State<ApiState>,
    body: Result<Json<AddTarget>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    let target = state.handle.add(request).await?;
    Ok((StatusCode::CREATED, Json(target)).into_response())
}

async fn get_target(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    match state.handle.get(TargetId::from(id.clone())).await? {
        Some(target) => Ok(Json(target).into_response()),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("target not found: {id}"),
        )),
    }
}

async fn remove_target(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let removed = state.handle.remove(TargetId::from(id)).await?;
    Ok(Json(json!({ "ok": true, "target": removed })).into_response())
}

async fn activate_target(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let target = state.handle.activate(TargetId::from(id)).await?;
    Ok(Json(target).into_response())
}

async fn deactivate_target(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let target = state.handle.deactivate(TargetId::from(id)).await?;
    Ok(Json(target).into_response())
}

async fn prepare_target(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let target = state.handle.prepare(TargetId::from(id)).await?;
    Ok((StatusCode::ACCEPTED, Json(target)).into_response())
}

async fn retry_target(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let target = state.handle.retry(TargetId::from(id)).await?;
    Ok((StatusCode::ACCEPTED, Json(target)).into_response())
}

async fn status(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let report = state.handle.status().await?;
    Ok(Json(report).into_response())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
