//! HTTP surface: read-only reporting plus batch control.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use civic_core::ExecutionRecord;

use crate::monitor::ResourceSnapshot;
use crate::orchestrator::Orchestrator;
use crate::scheduler::{BatchRequest, SchedulerError};
use crate::summary::RunSummary;

pub type AppState = Arc<Orchestrator>;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(err: SchedulerError) -> ApiError {
    let status = match &err {
        SchedulerError::BatchNotFound(_) => StatusCode::NOT_FOUND,
        SchedulerError::UnknownJob(_) | SchedulerError::InvalidCadence { .. } => StatusCode::BAD_REQUEST,
        SchedulerError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

/// Polling endpoints. Never mutate anything.
pub fn reporting_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/batches", get(list_batches))
        .route("/batches/{id}", get(get_batch))
        .route("/batches/{id}/executions", get(get_executions))
        .route("/resources", get(resources))
}

/// Trigger and cancel endpoints.
pub fn control_router() -> Router<AppState> {
    Router::new()
        .route("/batches", post(start_batch))
        .route("/batches/{id}/cancel", post(cancel_batch))
}

pub fn router(state: AppState) -> Router {
    reporting_router().merge(control_router()).with_state(state)
}

// ── Handlers ────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub jobs: usize,
    pub running_batches: usize,
    pub active_jobs: usize,
    pub slot_target: usize,
    pub active_slots: usize,
}

async fn health(State(orch): State<AppState>) -> Json<HealthResponse> {
    let scheduler = orch.scheduler();
    Json(HealthResponse {
        status: "ok".into(),
        jobs: scheduler.registry().len(),
        running_batches: scheduler.running_batches(),
        active_jobs: scheduler.active_jobs().len(),
        slot_target: scheduler.pool().target(),
        active_slots: scheduler.pool().active(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    /// Include finished batches still within retention.
    #[serde(default)]
    all: bool,
}

async fn list_batches(State(orch): State<AppState>, Query(params): Query<ListParams>) -> Json<Vec<RunSummary>> {
    if params.all {
        Json(orch.all_summaries())
    } else {
        Json(orch.active_summaries())
    }
}

async fn get_batch(State(orch): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<RunSummary>, ApiError> {
    orch.get_summary(id).map(Json).map_err(api_error)
}

async fn get_executions(
    State(orch): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ExecutionRecord>>, ApiError> {
    orch.executions(id).map(Json).map_err(api_error)
}

async fn resources(State(orch): State<AppState>) -> Json<ResourceSnapshot> {
    Json(orch.resources())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchStarted {
    pub batch_id: Uuid,
}

async fn start_batch(
    State(orch): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Result<(StatusCode, Json<BatchStarted>), ApiError> {
    let batch_id = orch.run_batch(&request).map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(BatchStarted { batch_id })))
}

async fn cancel_batch(State(orch): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    orch.cancel_batch(id).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Server ──────────────────────────────────────────────────────────

/// Serve `app` until `shutdown` flips to `true`.
pub fn spawn_http_server(
    addr: SocketAddr,
    app: Router,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(%addr, error = %e, "failed to bind HTTP server");
                return;
            }
        };

        tracing::info!(%addr, "HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut rx = shutdown;
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
            .ok();

        tracing::info!("HTTP server stopped");
    })
}
