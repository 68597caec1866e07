use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::cc::Cmd;
use crate::coordinator::CoordinatorError;
use crate::hooks::CallbackItem;
use crate::server::state::AppState;

/// Error envelope returned to HTTP callers.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        let status = match &err {
            CoordinatorError::InvalidParam(_) => StatusCode::BAD_REQUEST,
            CoordinatorError::IllegalState(_) => StatusCode::CONFLICT,
            CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
            CoordinatorError::Gateway(_) => StatusCode::BAD_GATEWAY,
            CoordinatorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct OrchestratorStatus {
    flows: usize,
    jobs: usize,
}

/// Orchestrator status endpoint
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let jobs = state.coordinator.list_jobs(None, None).await.len();
    Json(OrchestratorStatus {
        flows: state.flows.len(),
        jobs,
    })
}

#[derive(Debug, Deserialize)]
pub struct HookParams {
    pub identifier: String,
}

/// Webhook endpoint command-control posts callbacks to. The callback is
/// enqueued as-is; classification happens on the worker pool.
pub async fn hook_callback(
    State(state): State<AppState>,
    Query(params): Query<HookParams>,
    Json(cmd): Json<Cmd>,
) -> Result<StatusCode, ApiError> {
    let item = CallbackItem::new(params.identifier, cmd);
    state.callbacks.send(item).await.map_err(|e| {
        warn!("Callback queue unavailable: {}", e);
        ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "Callback queue unavailable".into(),
        }
    })?;
    Ok(StatusCode::OK)
}

/// Create and start a job for a flow.
pub async fn create_job(
    State(state): State<AppState>,
    Path(flow): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.coordinator.create_job(&flow).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    /// Restrict to one flow name.
    pub flow: Option<String>,
    /// Comma-separated flow names; returns the latest job of each.
    pub latest: Option<String>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsParams>,
) -> impl IntoResponse {
    let names: Option<Vec<String>> = params
        .latest
        .map(|l| l.split(',').map(|s| s.trim().to_string()).collect());
    let jobs = state
        .coordinator
        .list_jobs(params.flow.as_deref(), names.as_deref())
        .await;
    Json(jobs)
}

pub async fn get_job(
    State(state): State<AppState>,
    Path((flow, number)): Path<(String, u32)>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.coordinator.find_job_by_number(&flow, number).await?;
    Ok(Json(job))
}

pub async fn list_results(
    State(state): State<AppState>,
    Path((flow, number)): Path<(String, u32)>,
) -> Result<impl IntoResponse, ApiError> {
    let results = state.coordinator.list_node_results(&flow, number).await?;
    Ok(Json(results))
}

pub async fn stop_job(
    State(state): State<AppState>,
    Path((flow, number)): Path<(String, u32)>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.coordinator.stop_job(&flow, number).await?;
    Ok(Json(job))
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/hooks/cmd", post(hook_callback))
        .route("/jobs", get(list_jobs))
        .route("/flows/{flow}/jobs", post(create_job))
        .route("/flows/{flow}/jobs/{number}", get(get_job))
        .route("/flows/{flow}/jobs/{number}/results", get(list_results))
        .route("/flows/{flow}/jobs/{number}/stop", post(stop_job))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
