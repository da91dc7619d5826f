//! Worker control plane: registration, heartbeats, and fleet observability.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};

use fleet_common::{HeartbeatRequest, RegisterAck, RegisterRequest, WorkerSnapshot};

use crate::error::ApiError;
use crate::AppState;

/// POST /api/workers/register - join the fleet (idempotent by worker id)
async fn register(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterAck>, ApiError> {
    if request.worker_id.is_empty() {
        return Err(ApiError::validation("worker_id cannot be empty", "worker_id"));
    }
    if request.address.is_empty() {
        return Err(ApiError::validation("address cannot be empty", "address"));
    }

    let token = state
        .scheduler
        .registry
        .register(&request.worker_id, &request.address, request.capabilities)
        .await?;
    state.scheduler.kick();

    Ok(Json(RegisterAck {
        worker_id: request.worker_id,
        token,
    }))
}

/// POST /api/workers/:id/heartbeat - refresh liveness
async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .scheduler
        .registry
        .heartbeat(&worker_id, &request.token, request.in_flight)
        .await?;
    // The first heartbeat makes a joining worker assignable.
    state.scheduler.kick();
    Ok(StatusCode::OK)
}

/// DELETE /api/workers/:id - drain and remove
async fn deregister(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.scheduler.registry.deregister(&worker_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/workers - fleet snapshot
async fn list_workers(State(state): State<Arc<AppState>>) -> Json<Vec<WorkerSnapshot>> {
    Json(state.scheduler.registry.list_workers().await)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/workers/register", post(register))
        .route("/api/workers/:id/heartbeat", post(heartbeat))
        .route("/api/workers/:id", delete(deregister))
        .route("/api/workers", get(list_workers))
        .with_state(state)
}
