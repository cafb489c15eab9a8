//! Route definitions for the engine API

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::app_state::AppState;
use crate::handlers::*;

// Feed routes
pub fn feed_routes() -> Router<AppState> {
    Router::new()
        .route("/api/feeds", post(subscribe_feed))
        .route("/api/feeds/:id", delete(deactivate_feed))
        .route("/api/feeds/:id/data-points", post(ingest_data_point))
        .route("/api/feeds/:id/attestations", post(verify_attestation))
        .route("/api/projects/:id/feeds", get(list_project_feeds))
}

// Milestone and verification routes
pub fn milestone_routes() -> Router<AppState> {
    Router::new()
        .route("/api/milestones", post(register_milestone))
        .route("/api/milestones/:id/verifications", post(submit_verification))
        .route("/api/milestones/:id/verification", get(get_verification_status))
        .route("/api/milestones/:id/override", post(override_verification))
        .route("/api/milestones/:id/audit", get(get_audit_trail))
}

// Allocation and release routes
pub fn release_routes() -> Router<AppState> {
    Router::new()
        .route("/api/allocations", post(create_allocation))
        .route("/api/allocations/:id/approvals", post(add_approval))
        .route("/api/allocations/:id/release", post(execute_release))
}

// Audit routes
pub fn audit_routes() -> Router<AppState> {
    Router::new()
        .route("/api/audit", get(query_audit))
        .route("/api/audit/stats", get(get_performance_stats))
        .route("/api/audit/summary", get(get_audit_summary))
}

/// Every route, with state applied. CORS and tracing layers are added by the caller.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(feed_routes())
        .merge(milestone_routes())
        .merge(release_routes())
        .merge(audit_routes())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
