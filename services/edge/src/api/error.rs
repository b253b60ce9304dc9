//! API error shape shared by every edge handler.
//!
//! # Key invariants
//! - Every error body carries a stable `code` and a human-readable `message`.
//! - Upstream failures are logged here and surfaced without internal detail.
use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use edge_tokens::RejectReason;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: &str) -> Self {
        Self {
            status,
            body: ErrorResponse {
                code: code.to_string(),
                message: message.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn api_bad_request(code: &str, message: &str) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, code, message)
}

/// Map a token rejection: unknown or expired credentials are 401, a valid
/// credential used outside its scope is 403.
pub fn api_rejected(reason: RejectReason) -> ApiError {
    let (status, message) = match reason {
        RejectReason::NotFound => (StatusCode::UNAUTHORIZED, "unknown api token"),
        RejectReason::Expired => (StatusCode::UNAUTHORIZED, "api token expired"),
        RejectReason::InvalidType => (
            StatusCode::FORBIDDEN,
            "api token type not allowed on this endpoint",
        ),
        RejectReason::InvalidEnvironment => (
            StatusCode::FORBIDDEN,
            "api token not valid for this environment",
        ),
    };
    ApiError::new(status, reason.as_str(), message)
}

pub fn api_upstream(message: &str, err: &anyhow::Error) -> ApiError {
    tracing::warn!(error = %err, "{message}");
    ApiError::new(StatusCode::BAD_GATEWAY, "upstream_unavailable", message)
}

pub fn api_unavailable(message: &str) -> ApiError {
    ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
}
