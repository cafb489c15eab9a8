use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use super::{ok, ApiResult};
use crate::app_state::AppState;
use crate::auth::Actor;
use crate::error::EngineError;
use crate::models::{
    CreateMilestoneRequest, Milestone, OverrideVerificationRequest, SubmitVerificationRequest,
    VerificationReceipt, VerificationStatusView,
};

pub async fn register_milestone(
    State(state): State<AppState>,
    _actor: Actor,
    Json(payload): Json<CreateMilestoneRequest>,
) -> ApiResult<Milestone> {
    ok(state.verification_service.register_milestone(payload).await?)
}

/// A FAILED outcome is still a successful call; the receipt carries the reason.
/// The body is optional.
pub async fn submit_verification(
    State(state): State<AppState>,
    Path(milestone_id): Path<Uuid>,
    actor: Actor,
    body: Bytes,
) -> ApiResult<VerificationReceipt> {
    let evidence = if body.iter().all(u8::is_ascii_whitespace) {
        Vec::new()
    } else {
        serde_json::from_slice::<SubmitVerificationRequest>(&body)
            .map_err(|err| EngineError::Validation(format!("invalid request body: {}", err)))?
            .evidence
    };
    ok(state
        .verification_service
        .submit_verification(milestone_id, evidence, &actor)
        .await?)
}

pub async fn get_verification_status(
    State(state): State<AppState>,
    Path(milestone_id): Path<Uuid>,
) -> ApiResult<VerificationStatusView> {
    ok(state
        .verification_service
        .get_verification_status(milestone_id)
        .await?)
}

pub async fn override_verification(
    State(state): State<AppState>,
    Path(milestone_id): Path<Uuid>,
    actor: Actor,
    Json(payload): Json<OverrideVerificationRequest>,
) -> ApiResult<VerificationReceipt> {
    ok(state
        .verification_service
        .override_verification(milestone_id, &payload.justification, payload.evidence, &actor)
        .await?)
}
