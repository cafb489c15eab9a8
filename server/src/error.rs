//! Error taxonomy for the verification and release engine

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use uuid::Uuid;

use crate::models::ApiResponse;
use crate::oracle::signature::SignatureRejection;

/// Every failure the engine surfaces to callers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid signature from source {source_id}: {reason}")]
    InvalidSignature {
        source_id: String,
        reason: SignatureRejection,
    },

    #[error("stale data from source {source_id}: age {age_secs}s exceeds {max_staleness_secs}s")]
    StaleData {
        source_id: String,
        age_secs: i64,
        max_staleness_secs: i64,
    },

    #[error("future-dated data from source {source_id}: {ahead_secs}s ahead of server clock")]
    FutureData { source_id: String, ahead_secs: i64 },

    #[error("consensus not reached for {metric}")]
    ConsensusNotReached {
        metric: String,
        deviating_sources: Vec<String>,
    },

    #[error("confidence {actual:.4} below required {required:.4}")]
    BelowConfidenceThreshold { actual: f64, required: f64 },

    #[error("target not met for {metric}: measured {measured} < target {target}")]
    TargetNotMet {
        metric: String,
        measured: f64,
        target: f64,
    },

    #[error("milestone {milestone_id} is already verified")]
    AlreadyVerified { milestone_id: Uuid },

    #[error("milestone {milestone_id} has already been released")]
    AlreadyReleased { milestone_id: Uuid },

    #[error("milestone {milestone_id} has a verification attempt in progress ({attempt_id})")]
    VerificationInProgress { milestone_id: Uuid, attempt_id: Uuid },

    #[error("milestone {milestone_id} has no verified attempt")]
    NotVerified { milestone_id: Uuid },

    #[error("insufficient approvals: {have} of {need} required")]
    InsufficientApprovals { have: usize, need: usize },

    #[error("ledger submission failed: {0}")]
    LedgerSubmissionFailed(String),

    #[error("release retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Stable machine-readable kind, used in API responses and audit details.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidSignature { .. } => "InvalidSignature",
            EngineError::StaleData { .. } => "StaleData",
            EngineError::FutureData { .. } => "StaleData",
            EngineError::ConsensusNotReached { .. } => "ConsensusNotReached",
            EngineError::BelowConfidenceThreshold { .. } => "BelowConfidenceThreshold",
            EngineError::TargetNotMet { .. } => "TargetNotMet",
            EngineError::AlreadyVerified { .. } => "AlreadyVerified",
            EngineError::AlreadyReleased { .. } => "AlreadyReleased",
            EngineError::VerificationInProgress { .. } => "VerificationInProgress",
            EngineError::NotVerified { .. } => "NotVerified",
            EngineError::InsufficientApprovals { .. } => "InsufficientApprovals",
            EngineError::LedgerSubmissionFailed(_) => "LedgerSubmissionFailed",
            EngineError::RetriesExhausted { .. } => "RetriesExhausted",
            EngineError::Unauthorized(_) => "Unauthorized",
            EngineError::Validation(_) => "Validation",
            EngineError::NotFound(_) => "NotFound",
            EngineError::Storage(_) => "Storage",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::InvalidSignature { .. }
            | EngineError::StaleData { .. }
            | EngineError::FutureData { .. }
            | EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::ConsensusNotReached { .. }
            | EngineError::BelowConfidenceThreshold { .. }
            | EngineError::TargetNotMet { .. }
            | EngineError::NotVerified { .. }
            | EngineError::InsufficientApprovals { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::AlreadyVerified { .. }
            | EngineError::AlreadyReleased { .. }
            | EngineError::VerificationInProgress { .. } => StatusCode::CONFLICT,
            EngineError::LedgerSubmissionFailed(_) => StatusCode::BAD_GATEWAY,
            EngineError::RetriesExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Conflicts are idempotent-looking repeats that must stay distinct from success.
    pub fn is_conflict(&self) -> bool {
        self.status_code() == StatusCode::CONFLICT
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Storage(format!("encoding error: {}", err))
    }
}

impl From<validator::ValidationErrors> for EngineError {
    fn from(err: validator::ValidationErrors) -> Self {
        EngineError::Validation(err.to_string())
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "request failed");
        }
        let body: ApiResponse<()> = ApiResponse::failure(self.kind(), self.to_string());
        (status, Json(body)).into_response()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
