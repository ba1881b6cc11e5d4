//! REST API handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use gpuadmit_core::{
    AdmitError, ConfigUpdate, Job, JobCategory, JobStatus, ResourceClass, SchedulerSettings,
};
use gpuadmit_scheduler::{
    AdmissionController, CategoryRank, DeviceStatus, JobFilter, SchedulerStatus, SubmitRequest,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

/// Application state shared across handlers
pub struct AppState {
    pub controller: AdmissionController,
}

type ApiError = (StatusCode, String);

/// Create the API router
pub fn create_router(controller: AdmissionController) -> Router {
    let state = Arc::new(AppState { controller });

    Router::new()
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/jobs", get(list_jobs).post(submit_job))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/cancel", post(cancel_job))
        .route("/api/v1/queue", get(get_queue))
        .route("/api/v1/config", get(get_config).put(update_config))
        .route("/api/v1/priorities", get(get_priorities).put(set_priorities))
        .route("/api/v1/devices/refresh", post(refresh_devices))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(e: AdmitError) -> ApiError {
    match e {
        AdmitError::TaskNotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        _ if e.is_validation() => (StatusCode::BAD_REQUEST, e.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Request to submit a job
///
/// The category is taken as a plain string so that a malformed name is
/// reported as a bad request rather than a body decoding failure.
#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub category: String,
    #[serde(default)]
    pub resource_class: ResourceClass,
    #[serde(default)]
    pub context_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub task_id: Uuid,
    pub status: JobStatus,
}

/// Submit a job
async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let category: JobCategory = req.category.parse().map_err(error_response)?;

    let task_id = state
        .controller
        .submit(SubmitRequest {
            category,
            resource_class: req.resource_class,
            context_id: req.context_id,
            payload: req.payload,
        })
        .await
        .map_err(error_response)?;

    let job = state.controller.job(task_id).await.map_err(error_response)?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitJobResponse {
            task_id,
            status: job.status,
        }),
    ))
}

/// Query parameters for job listings
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub context_id: Option<String>,
}

/// List jobs, optionally filtered by status and context
async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(error_response)?;

    let filter = JobFilter {
        status,
        context_id: query.context_id,
    };
    Ok(Json(state.controller.jobs(&filter).await))
}

/// Get a specific job
async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    state.controller.job(id).await.map(Json).map_err(error_response)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub task_id: Uuid,
    pub status: JobStatus,
}

/// Cancel a job
async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelResponse>, ApiError> {
    info!(task_id = %id, "Cancel requested");

    let status = state.controller.cancel(id).await.map_err(error_response)?;
    Ok(Json(CancelResponse {
        task_id: id,
        status,
    }))
}

/// Queued jobs in dequeue order
async fn get_queue(State(state): State<Arc<AppState>>) -> Json<Vec<Job>> {
    Json(state.controller.queue_order().await)
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<SchedulerSettings> {
    Json(state.controller.config().await)
}

/// Update scheduler configuration; returns the effective values
async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ConfigUpdate>,
) -> Result<Json<SchedulerSettings>, ApiError> {
    if update.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "No configuration fields given".to_string(),
        ));
    }

    state
        .controller
        .update_config(update)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn get_priorities(State(state): State<Arc<AppState>>) -> Json<Vec<CategoryRank>> {
    Json(state.controller.priorities().await)
}

/// New priority order, highest first
#[derive(Debug, Deserialize)]
pub struct PriorityOrderRequest {
    pub order: Vec<String>,
}

/// Replace the priority order
async fn set_priorities(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PriorityOrderRequest>,
) -> Result<Json<Vec<CategoryRank>>, ApiError> {
    let order = req
        .order
        .iter()
        .map(|name| name.parse::<JobCategory>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(error_response)?;

    state
        .controller
        .set_priority_order(order)
        .await
        .map(Json)
        .map_err(error_response)
}

/// Re-detect GPUs
async fn refresh_devices(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DeviceStatus>>, ApiError> {
    state
        .controller
        .refresh_devices()
        .await
        .map(Json)
        .map_err(error_response)
}

/// System status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    #[serde(flatten)]
    pub scheduler: SchedulerStatus,
}

/// Get system status
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        scheduler: state.controller.status().await,
    })
}
