//! Internal operational endpoints.
//!
//! Served on a separate bind. Everything here is read-only or an idempotent
//! trigger.
use crate::api::auth::{invalid_environment_name, is_valid_environment_name};
use crate::api::error::{ApiError, api_upstream};
use crate::app::AppState;
use crate::cache::{CacheEntrySummary, RefreshOutcome};
use crate::streaming::StreamingStats;
use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshQuery {
    pub environment: Option<String>,
}

pub(crate) async fn health() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
        tokens: None,
    })
}

pub(crate) async fn ready(State(state): State<AppState>) -> (StatusCode, Json<StatusResponse>) {
    if state.mirror.is_initialized() {
        (
            StatusCode::OK,
            Json(StatusResponse {
                status: "ready".to_string(),
                tokens: Some(state.mirror.len()),
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(StatusResponse {
                status: "starting".to_string(),
                tokens: None,
            }),
        )
    }
}

pub(crate) async fn cache_summary(State(state): State<AppState>) -> Json<Vec<CacheEntrySummary>> {
    Json(state.cache.summary())
}

pub(crate) async fn cache_refresh(
    State(state): State<AppState>,
    Query(query): Query<RefreshQuery>,
) -> Result<Json<Vec<RefreshOutcome>>, ApiError> {
    let outcomes = match query.environment.filter(|env| !env.is_empty()) {
        Some(environment) => {
            if !is_valid_environment_name(&environment) {
                return Err(invalid_environment_name());
            }
            let result = state.cache.refresh(&environment).await;
            vec![RefreshOutcome {
                environment,
                ok: result.is_ok(),
                error: result.err().map(|err| format!("{err:#}")),
            }]
        }
        None => state.cache.refresh_all().await,
    };
    Ok(Json(outcomes))
}

pub(crate) async fn tokens_refresh(
    State(state): State<AppState>,
) -> Result<Json<StatusResponse>, ApiError> {
    let count = state
        .mirror
        .refresh()
        .await
        .map_err(|err| api_upstream("token refresh failed", &err))?;
    tracing::info!(tokens = count, "manual token refresh");
    Ok(Json(StatusResponse {
        status: "refreshed".to_string(),
        tokens: Some(count),
    }))
}

pub(crate) async fn streaming_stats(State(state): State<AppState>) -> Json<StreamingStats> {
    Json(state.streaming.stats())
}
