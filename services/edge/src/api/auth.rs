// Request authentication against the local token mirror.
// Every accepted credential is counted towards token usage.
use crate::api::error::{ApiError, api_bad_request, api_rejected};
use crate::app::AppState;
use crate::authority::API_TOKEN_HEADER;
use axum::http::HeaderMap;
use edge_tokens::{MirroredToken, TokenType, TokenValidation};
use serde::Deserialize;
use std::sync::Arc;

pub const ENVIRONMENT_HEADER: &str = "x-environment";
const MAX_ENVIRONMENT_NAME_LEN: usize = 100;

/// Query fallbacks for clients that cannot set headers (browser streams).
#[derive(Debug, Default, Deserialize)]
pub struct AuthQuery {
    pub token: Option<String>,
    pub environment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Authenticated {
    pub token: Arc<MirroredToken>,
    pub environment: String,
}

fn header_or_query(headers: &HeaderMap, name: &str, fallback: Option<&String>) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| fallback.cloned())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Validate the request credential. `required = None` accepts any token type
/// scoped to the environment.
pub fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    query: &AuthQuery,
    required: Option<TokenType>,
) -> Result<Authenticated, ApiError> {
    let secret = header_or_query(headers, API_TOKEN_HEADER, query.token.as_ref())
        .ok_or_else(|| api_bad_request("missing_token", "x-api-token is required"))?;
    let environment = header_or_query(headers, ENVIRONMENT_HEADER, query.environment.as_ref())
        .ok_or_else(|| api_bad_request("missing_environment", "environment is required"))?;
    if !is_valid_environment_name(&environment) {
        metrics::counter!("edge_auth_rejections_total", "reason" => "invalid_environment_name")
            .increment(1);
        return Err(invalid_environment_name());
    }

    let validation = match required {
        Some(required) => state.mirror.validate(&secret, required, Some(&environment)),
        None => validate_any_type(state, &secret, &environment),
    };
    match validation {
        TokenValidation::Valid(token) => {
            state.usage.record_usage(token.id);
            Ok(Authenticated { token, environment })
        }
        TokenValidation::Rejected { reason, token } => {
            tracing::debug!(
                reason = reason.as_str(),
                token_id = token.map(|t| t.id),
                environment = %environment,
                "request credential rejected"
            );
            metrics::counter!("edge_auth_rejections_total", "reason" => reason.as_str())
                .increment(1);
            Err(api_rejected(reason))
        }
    }
}

/// Environment names are single path segments: ASCII letters, digits, `_`,
/// `-` and `.`, excluding the relative segments `.` and `..`.
pub fn is_valid_environment_name(environment: &str) -> bool {
    !environment.is_empty()
        && environment.len() <= MAX_ENVIRONMENT_NAME_LEN
        && environment != "."
        && environment != ".."
        && environment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}

pub fn invalid_environment_name() -> ApiError {
    api_bad_request(
        "invalid_environment_name",
        "environment may only contain letters, digits, '_', '-' and '.'",
    )
}

fn validate_any_type(state: &AppState, secret: &str, environment: &str) -> TokenValidation {
    for required in [TokenType::Client, TokenType::Server] {
        let validation = state.mirror.validate(secret, required, Some(environment));
        if validation.reason() != Some(edge_tokens::RejectReason::InvalidType) {
            return validation;
        }
    }
    state.mirror.validate(secret, TokenType::Edge, Some(environment))
}
