//! SDK-facing flag reads and metrics ingest.
//!
//! Reads come from the flag cache. Metrics are buffered and acknowledged with
//! 202 before anything is sent upstream.
use crate::api::auth::{AuthQuery, authenticate};
use crate::api::error::{ApiError, api_bad_request, api_upstream};
use crate::app::AppState;
use crate::authority::{ClientMetricsPayload, ServerMetricsPayload};
use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use edge_tokens::TokenType;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnknownFlagIngest {
    pub app_name: String,
    pub flag_name: String,
    #[serde(default)]
    pub count: Option<u64>,
}

async fn features(
    state: &AppState,
    headers: &HeaderMap,
    query: &AuthQuery,
    required: TokenType,
) -> Result<Json<serde_json::Value>, ApiError> {
    let auth = authenticate(state, headers, query, Some(required))?;
    let snapshot = state
        .cache
        .get(&auth.environment)
        .await
        .map_err(|err| api_upstream("flag snapshot unavailable", &err))?;
    Ok(Json(snapshot.as_ref().clone()))
}

pub(crate) async fn client_features(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    features(&state, &headers, &query, TokenType::Client).await
}

pub(crate) async fn server_features(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    features(&state, &headers, &query, TokenType::Server).await
}

fn require_app_name(app_name: &str) -> Result<(), ApiError> {
    if app_name.trim().is_empty() {
        return Err(api_bad_request("missing_app_name", "appName is required"));
    }
    Ok(())
}

pub(crate) async fn client_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
    Json(payload): Json<ClientMetricsPayload>,
) -> Result<StatusCode, ApiError> {
    let auth = authenticate(&state, &headers, &query, Some(TokenType::Client))?;
    require_app_name(&payload.app_name)?;
    state
        .metrics
        .add_client_metrics(&auth.environment, &payload.app_name, payload.bucket);
    Ok(StatusCode::ACCEPTED)
}

pub(crate) async fn server_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
    Json(payload): Json<ServerMetricsPayload>,
) -> Result<StatusCode, ApiError> {
    let auth = authenticate(&state, &headers, &query, Some(TokenType::Server))?;
    require_app_name(&payload.app_name)?;
    state
        .metrics
        .add_server_metrics(&auth.environment, &payload.app_name, payload.metrics);
    Ok(StatusCode::ACCEPTED)
}

pub(crate) async fn server_unknown_flag(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
    Json(payload): Json<UnknownFlagIngest>,
) -> Result<StatusCode, ApiError> {
    let auth = authenticate(&state, &headers, &query, Some(TokenType::Server))?;
    require_app_name(&payload.app_name)?;
    if payload.flag_name.trim().is_empty() {
        return Err(api_bad_request("missing_flag_name", "flagName is required"));
    }
    state.metrics.add_server_unknown_report(
        &auth.environment,
        &payload.app_name,
        &payload.flag_name,
        payload.count.unwrap_or(1),
    );
    Ok(StatusCode::ACCEPTED)
}
