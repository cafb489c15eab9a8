//! API handlers for the verification and release engine

pub mod audit;
pub mod oracle;
pub mod release;
pub mod verification;

pub use audit::*;
pub use oracle::*;
pub use release::*;
pub use verification::*;

use axum::Json;

use crate::models::ApiResponse;

/// Result type shared by every handler; errors render through `EngineError`'s `IntoResponse`.
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, crate::error::EngineError>;

pub(crate) fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::ok(data)))
}
