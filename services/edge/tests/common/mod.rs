#![allow(dead_code)]
// Throwaway authority server and edge wiring shared by integration tests.
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Json, Router};
use edge::app::AppState;
use edge::authority::{AuthorityApi, HttpAuthority};
use edge::cache::FlagCache;
use edge::mirror::TokenMirror;
use edge::streaming::{StreamingOptions, StreamingService};
use edge::telemetry::{MetricsAggregator, UsageTracker};
use edge_coord::{CoordinationStore, DEFAULT_CHANGE_CHANNEL};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Default)]
pub struct AuthorityState {
    pub tokens: Mutex<Vec<Value>>,
    pub flag_version: AtomicU64,
    pub token_fetches: AtomicUsize,
    pub flag_fetches: AtomicUsize,
    pub usage_reports: Mutex<Vec<Value>>,
    pub metrics_posts: Mutex<Vec<(String, String, Value)>>,
}

pub fn token_json(id: u64, secret: &str, token_type: &str, environments: &[&str]) -> Value {
    json!({
        "id": id,
        "tokenValue": secret,
        "tokenName": format!("token-{id}"),
        "tokenType": token_type,
        "allowAllEnvironments": false,
        "environments": environments,
        "createdAt": "2024-01-01T00:00:00Z",
        "updatedAt": "2024-01-01T00:00:00Z"
    })
}

async fn list_tokens(State(state): State<Arc<AuthorityState>>) -> Json<Value> {
    state.token_fetches.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "tokens": state.tokens.lock().clone() }))
}

async fn environment_flags(
    State(state): State<Arc<AuthorityState>>,
    Path(environment): Path<String>,
) -> Json<Value> {
    state.flag_fetches.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "environment": environment,
        "version": state.flag_version.load(Ordering::SeqCst),
        "features": [{"name": "checkout", "enabled": true}]
    }))
}

async fn token_usage(
    State(state): State<Arc<AuthorityState>>,
    Json(body): Json<Value>,
) -> StatusCode {
    state.usage_reports.lock().push(body);
    StatusCode::ACCEPTED
}

async fn metrics(
    State(state): State<Arc<AuthorityState>>,
    Path((environment, kind)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> StatusCode {
    state.metrics_posts.lock().push((environment, kind, body));
    StatusCode::ACCEPTED
}

pub async fn start_authority(state: Arc<AuthorityState>) -> String {
    let app = Router::new()
        .route("/api/v1/edge/tokens", axum::routing::get(list_tokens))
        .route(
            "/api/v1/edge/environments/:environment/flags",
            axum::routing::get(environment_flags),
        )
        .route("/api/v1/edge/token-usage", axum::routing::post(token_usage))
        .route(
            "/api/v1/edge/environments/:environment/metrics/:kind",
            axum::routing::post(metrics),
        )
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service()).await;
    });
    format!("http://{addr}")
}

/// One edge instance wired the way the binary wires it, minus listeners.
pub async fn edge_instance(
    base_url: &str,
    store: Arc<dyn CoordinationStore>,
    instance_id: &str,
) -> AppState {
    let authority: Arc<dyn AuthorityApi> = Arc::new(
        HttpAuthority::new(base_url, "edge-secret", "edge-it", Duration::from_secs(2))
            .expect("authority"),
    );
    let mirror = Arc::new(TokenMirror::new(
        Arc::clone(&authority),
        Arc::clone(&store),
        DEFAULT_CHANGE_CHANNEL,
    ));
    mirror.initialize(None).await.expect("initialize");
    let cache = Arc::new(FlagCache::new(Arc::clone(&authority)));
    let streaming = Arc::new(StreamingService::new(
        store,
        Arc::clone(&cache),
        StreamingOptions::default(),
    ));
    streaming.start().await;
    AppState {
        mirror,
        cache,
        streaming,
        metrics: Arc::new(MetricsAggregator::new(Arc::clone(&authority))),
        usage: Arc::new(UsageTracker::new(authority, instance_id)),
        stream_queue_capacity: 16,
    }
}

pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
