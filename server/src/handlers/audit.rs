use axum::extract::{Path, Query, State};
use uuid::Uuid;

use super::{ok, ApiResult};
use crate::app_state::AppState;
use crate::models::{
    AuditEntry, AuditQuery, AuditSummary, PerformanceQuery, PerformanceStats, TrailQuery,
};

pub async fn get_audit_trail(
    State(state): State<AppState>,
    Path(milestone_id): Path<Uuid>,
    Query(query): Query<TrailQuery>,
) -> ApiResult<Vec<AuditEntry>> {
    ok(state.audit.trail(milestone_id, query.limit).await?)
}

pub async fn query_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Vec<AuditEntry>> {
    ok(state.audit.query(&query).await?)
}

pub async fn get_performance_stats(
    State(state): State<AppState>,
    Query(query): Query<PerformanceQuery>,
) -> ApiResult<Vec<PerformanceStats>> {
    ok(state.audit.performance_stats(query.operation).await?)
}

pub async fn get_audit_summary(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<AuditSummary> {
    ok(state.audit.summary(&query).await?)
}
