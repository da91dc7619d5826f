//! Health probe.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::AppState;

/// GET /health - gateway liveness and fleet counters
async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let scheduler = &state.scheduler;
    Json(json!({
        "status": "ok",
        "workers": scheduler.registry.count().await,
        "queue": scheduler.queue.depth_by_priority(),
        "in_flight": scheduler.dispatcher.inflight_count().await,
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}
