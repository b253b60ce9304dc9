//! Edge HTTP application wiring.
//!
//! # Purpose
//! Builds the public SDK router and the internal operations router, and
//! defines the shared state injected into handlers.
use crate::api;
use crate::cache::FlagCache;
use crate::mirror::TokenMirror;
use crate::observability;
use crate::streaming::StreamingService;
use crate::telemetry::{MetricsAggregator, UsageTracker};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_opentelemetry::OpenTelemetrySpanExt;

#[derive(Clone)]
pub struct AppState {
    pub mirror: Arc<TokenMirror>,
    pub cache: Arc<FlagCache>,
    pub streaming: Arc<StreamingService>,
    pub metrics: Arc<MetricsAggregator>,
    pub usage: Arc<UsageTracker>,
    pub stream_queue_capacity: usize,
}

pub fn build_router(state: AppState) -> Router {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            let parent = observability::trace_context_from_headers(request.headers());
            let span = tracing::info_span!(
                "http.request",
                method = %request.method(),
                path = %request.uri().path(),
                version = ?request.version()
            );
            span.set_parent(parent);
            span
        });

    Router::new()
        .route(
            "/api/v1/client/features",
            axum::routing::get(api::client::client_features),
        )
        .route(
            "/api/v1/server/features",
            axum::routing::get(api::client::server_features),
        )
        .route(
            "/api/v1/client/metrics",
            axum::routing::post(api::client::client_metrics),
        )
        .route(
            "/api/v1/server/metrics",
            axum::routing::post(api::client::server_metrics),
        )
        .route(
            "/api/v1/server/metrics/unknown",
            axum::routing::post(api::client::server_unknown_flag),
        )
        .route(
            "/api/v1/stream/sse",
            axum::routing::get(api::stream::sse_stream),
        )
        .route(
            "/api/v1/stream/ws",
            axum::routing::get(api::stream::ws_stream),
        )
        .layer(trace_layer)
        .with_state(state)
}

pub fn build_internal_router(state: AppState) -> Router {
    Router::new()
        .route("/internal/health", axum::routing::get(api::internal::health))
        .route("/internal/ready", axum::routing::get(api::internal::ready))
        .route(
            "/internal/cache/summary",
            axum::routing::get(api::internal::cache_summary),
        )
        .route(
            "/internal/cache/refresh",
            axum::routing::post(api::internal::cache_refresh),
        )
        .route(
            "/internal/tokens/refresh",
            axum::routing::post(api::internal::tokens_refresh),
        )
        .route(
            "/internal/streaming/stats",
            axum::routing::get(api::internal::streaming_stats),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
