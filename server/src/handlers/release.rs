use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use super::{ok, ApiResult};
use crate::app_state::AppState;
use crate::auth::Actor;
use crate::models::{
    ApprovalCount, CreateAllocationRequest, ExecuteReleaseRequest, FundAllocation, ReleaseReceipt,
};

pub async fn create_allocation(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<CreateAllocationRequest>,
) -> ApiResult<FundAllocation> {
    ok(state.release_service.create_allocation(payload, &actor).await?)
}

pub async fn add_approval(
    State(state): State<AppState>,
    Path(allocation_id): Path<Uuid>,
    actor: Actor,
) -> ApiResult<ApprovalCount> {
    ok(state.release_service.add_approval(allocation_id, &actor).await?)
}

pub async fn execute_release(
    State(state): State<AppState>,
    Path(allocation_id): Path<Uuid>,
    actor: Actor,
    Json(payload): Json<ExecuteReleaseRequest>,
) -> ApiResult<ReleaseReceipt> {
    ok(state
        .release_service
        .execute_release(allocation_id, payload, &actor)
        .await?)
}
