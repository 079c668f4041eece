//! API Module
//!
//! HTTP API layer for the job pipeline.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod job;
pub mod session;

use axum::{
    Router,
    routing::{get, post},
};
use quill_store::{JobStore, RateLimitGuard};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub guard: RateLimitGuard,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        let guard = RateLimitGuard::new(store.clone());
        Self { store, guard }
    }
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Job endpoints
        .route("/jobs", post(job::enqueue_job).get(job::list_jobs))
        .route("/jobs/stats", get(job::job_stats))
        .route("/jobs/{id}", get(job::get_job))
        .route("/jobs/{id}/override", post(job::override_job))
        // Session endpoints
        .route("/session", get(session::session_stats))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
