//! FleetAI gateway: a unified request surface over a fleet of LLM workers.

pub mod adapter;
pub mod config;
pub mod error;
pub mod logging;
pub mod openai;
pub mod routes;
pub mod scheduler;
pub mod test_util;

pub use adapter::{HttpWorkerAdapter, WorkerAdapter};
pub use config::{Config, SchedulerConfig};
pub use error::ApiError;
pub use scheduler::Scheduler;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub scheduler: Arc<Scheduler>,
}

/// Build the full gateway router.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health::router(state.clone()))
        .merge(routes::native::router(state.clone()))
        .merge(routes::openai::router(state.clone()))
        .merge(routes::workers::router(state))
        .layer(axum::middleware::from_fn(logging::request_logger))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
