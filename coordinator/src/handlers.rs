use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, FromRequest, Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use common::{
    CancelJobResponse, ClaimRequest, ClaimResponse, CompleteTaskRequest, CompleteTaskResponse,
    CreateJobRequest, CreateJobResponse, CreateTaskRequest, CreateTaskResponse, ErrorBody,
    FailTaskRequest, FailTaskResponse, HealthResponse, HeartbeatRequest, HeartbeatResponse,
    HelloResponse, JobInfo, JobResults, SpotList, TaskInfo, AGENT_KEY_HEADER,
};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::{CoordinatorError, Result};
use crate::model::{CancelOutcome, CompleteOutcome, FailOutcome};
use crate::state::AppState;

/// `Json` extractor whose rejections carry the usual `{error}` body.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(CoordinatorError))]
struct JsonBody<T>(T);

pub fn build_router(state: AppState) -> Router {
    let internal = Router::new()
        .route("/hello", post(hello))
        .route("/heartbeat", post(heartbeat))
        .route("/tasks/claim", post(claim_tasks))
        .route("/tasks/:id/complete", post(complete_task))
        .route("/tasks/:id/fail", post(fail_task))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_agent_key,
        ));

    Router::new()
        .nest("/internal/v1", internal)
        .route("/api/v1/health", get(health))
        .route("/api/v1/spots", get(list_spots))
        .route("/api/v1/spots/:id", delete(delete_spot))
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/results", get(get_job_results))
        .route("/api/v1/jobs/:id/cancel", post(cancel_job))
        .route("/api/v1/tasks", post(create_task))
        .route("/api/v1/tasks/:id", get(get_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Rejects internal calls whose key header does not match the configured secret.
async fn require_agent_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Some(expected) = state.agent_key.as_deref() {
        let given = req
            .headers()
            .get(AGENT_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if given != Some(expected) {
            warn!("rejected {} {}: bad or missing agent key", req.method(), req.uri());
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody {
                    error: "invalid agent key".into(),
                }),
            )
                .into_response();
        }
    }
    next.run(req).await
}

fn peer_ip(peer: Option<ConnectInfo<SocketAddr>>) -> String {
    peer.map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/* ---------------- internal (spot-facing) ---------------- */

async fn hello(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Result<Json<HelloResponse>> {
    let resp = state.coordinator.hello(&peer_ip(peer)).await?;
    Ok(Json(resp))
}

async fn heartbeat(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    JsonBody(req): JsonBody<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>> {
    state.coordinator.heartbeat(req, &peer_ip(peer)).await?;
    Ok(Json(HeartbeatResponse { ok: true }))
}

async fn claim_tasks(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<ClaimRequest>,
) -> Result<Json<ClaimResponse>> {
    Ok(Json(state.coordinator.claim(req).await?))
}

async fn complete_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    JsonBody(req): JsonBody<CompleteTaskRequest>,
) -> Result<Json<CompleteTaskResponse>> {
    let spot_id = req.spot_id.clone();
    match state.coordinator.complete(&task_id, req).await? {
        CompleteOutcome::Completed => Ok(Json(CompleteTaskResponse {
            success: true,
            message: None,
        })),
        CompleteOutcome::AlreadyDone => Ok(Json(CompleteTaskResponse {
            success: true,
            message: Some("task already completed".into()),
        })),
        CompleteOutcome::NotFound => Err(CoordinatorError::NotFound(format!(
            "task {task_id} not found"
        ))),
        CompleteOutcome::WrongSpot => Err(CoordinatorError::Conflict(format!(
            "task {task_id} is not assigned to spot {spot_id}"
        ))),
    }
}

async fn fail_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    JsonBody(req): JsonBody<FailTaskRequest>,
) -> Result<Json<FailTaskResponse>> {
    let spot_id = req.spot_id.clone();
    match state.coordinator.fail(&task_id, req).await? {
        FailOutcome::Retried => Ok(Json(FailTaskResponse {
            success: true,
            will_retry: true,
            message: None,
        })),
        FailOutcome::Failed => Ok(Json(FailTaskResponse {
            success: true,
            will_retry: false,
            message: None,
        })),
        FailOutcome::AlreadyTerminal => Ok(Json(FailTaskResponse {
            success: true,
            will_retry: false,
            message: Some("task already in a terminal state".into()),
        })),
        FailOutcome::NotFound => Err(CoordinatorError::NotFound(format!(
            "task {task_id} not found"
        ))),
        FailOutcome::WrongSpot => Err(CoordinatorError::Conflict(format!(
            "task {task_id} is not assigned to spot {spot_id}"
        ))),
    }
}

/* ---------------- public (client-facing) ---------------- */

async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    Ok(Json(state.coordinator.health().await?))
}

async fn list_spots(State(state): State<AppState>) -> Result<Json<SpotList>> {
    Ok(Json(state.coordinator.list_spots().await?))
}

async fn delete_spot(
    State(state): State<AppState>,
    Path(spot_id): Path<String>,
) -> Result<StatusCode> {
    state.coordinator.delete_spot(&spot_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_job(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>)> {
    let resp = state.coordinator.create_job(req).await?;
    Ok((StatusCode::CREATED, Json(resp)))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobInfo>> {
    Ok(Json(state.coordinator.get_job(&job_id).await?))
}

async fn get_job_results(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResults>> {
    Ok(Json(state.coordinator.job_results(&job_id).await?))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<CancelJobResponse>> {
    match state.coordinator.cancel_job(&job_id).await? {
        CancelOutcome::Cancelled {
            job,
            cancelled_tasks,
        } => Ok(Json(CancelJobResponse {
            job_id: job.id,
            status: job.status,
            cancelled_tasks,
        })),
        CancelOutcome::AlreadyTerminal(status) => Err(CoordinatorError::Conflict(format!(
            "job {job_id} is already {status}"
        ))),
        CancelOutcome::NotFound => Err(CoordinatorError::NotFound(format!(
            "job {job_id} not found"
        ))),
    }
}

async fn create_task(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<CreateTaskRequest>,
) -> Result<(StatusCode, Json<CreateTaskResponse>)> {
    let resp = state.coordinator.create_task(req).await?;
    Ok((StatusCode::CREATED, Json(resp)))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskInfo>> {
    Ok(Json(state.coordinator.get_task(&task_id).await?))
}
