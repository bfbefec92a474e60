//! HTTP admin surface for the master.
//!
//! Provides endpoints for:
//! - Task submission, listing, detail and cancellation (`/v1/tasks`)
//! - Worker list (`/v1/workers`), per-worker usage history
//!   (`/v1/workers/:id/usage`) and discovered nodes (`/v1/discovered`)
//! - Task and worker statistics (`/v1/stats`)
//! - Task event stream (`/v1/events`, server-sent events)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::MasterState;

mod handlers;
pub mod responses;

/// Create the HTTP router.
pub fn create_router(state: Arc<MasterState>) -> Router {
    // CORS layer for browser dashboards
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // API routes
        .route("/v1/tasks", get(handlers::list_tasks).post(handlers::submit_task))
        .route("/v1/tasks/:id", get(handlers::get_task))
        .route("/v1/tasks/:id/cancel", post(handlers::cancel_task))
        .route("/v1/workers", get(handlers::list_workers))
        .route("/v1/workers/:id/usage", get(handlers::worker_usage))
        .route("/v1/stats", get(handlers::get_stats))
        .route("/v1/discovered", get(handlers::list_discovered))
        .route("/v1/events", get(handlers::stream_events))
        // Observability routes
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
