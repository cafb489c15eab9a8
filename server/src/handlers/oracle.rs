use axum::{
    extract::{Path, Query, State},
    Json,
};
use uuid::Uuid;

use super::{ok, ApiResult};
use crate::app_state::AppState;
use crate::auth::Actor;
use crate::models::{
    AttestationRequest, CreateFeedRequest, DataPointReceipt, ListFeedsQuery, OracleFeed,
    SubmitDataPointRequest,
};
use crate::oracle::signature::MultiSignatureResult;

pub async fn subscribe_feed(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<CreateFeedRequest>,
) -> ApiResult<OracleFeed> {
    ok(state.oracle_service.subscribe_feed(payload, &actor).await?)
}

pub async fn deactivate_feed(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    actor: Actor,
) -> ApiResult<OracleFeed> {
    ok(state.oracle_service.deactivate_feed(id, &actor).await?)
}

pub async fn list_project_feeds(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<ListFeedsQuery>,
) -> ApiResult<Vec<OracleFeed>> {
    ok(state
        .oracle_service
        .list_feeds(project_id, query.include_inactive)
        .await?)
}

pub async fn ingest_data_point(
    State(state): State<AppState>,
    Path(feed_id): Path<Uuid>,
    actor: Actor,
    Json(payload): Json<SubmitDataPointRequest>,
) -> ApiResult<DataPointReceipt> {
    ok(state
        .oracle_service
        .ingest_data_point(feed_id, payload, &actor)
        .await?)
}

pub async fn verify_attestation(
    State(state): State<AppState>,
    Path(feed_id): Path<Uuid>,
    actor: Actor,
    Json(payload): Json<AttestationRequest>,
) -> ApiResult<MultiSignatureResult> {
    ok(state
        .oracle_service
        .verify_attestation(feed_id, payload, &actor)
        .await?)
}
