// Edge service main entry point.
use anyhow::{Context, Result};
use edge::app::{AppState, build_internal_router, build_router};
use edge::authority::{AuthorityApi, HttpAuthority};
use edge::cache::FlagCache;
use edge::config::EdgeConfig;
use edge::mirror::TokenMirror;
use edge::observability::{self, Readiness};
use edge::streaming::{StreamingOptions, StreamingService};
use edge::telemetry::{MetricsAggregator, UsageTracker};
use edge_coord::{CoordinationStore, MemoryStore, RedisStore, RevisionKeys};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let config = EdgeConfig::from_env_or_yaml()?;
    run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn connect_store(config: &EdgeConfig) -> Result<Arc<dyn CoordinationStore>> {
    let Some(url) = config.redis_url.as_deref() else {
        tracing::warn!("EDGE_REDIS_URL not set; using in-process coordination store");
        return Ok(Arc::new(MemoryStore::new()));
    };
    // An unreachable server is not an error here; commands retry until it is back.
    let store = RedisStore::connect(url)
        .await
        .context("coordination store url")?;
    Ok(Arc::new(store))
}

async fn run_with_shutdown<F>(config: EdgeConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("flag-edge");
    let readiness = Readiness::default();
    let metrics_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        readiness.clone(),
        config.metrics_bind,
    ));

    let store = connect_store(&config).await?;
    tracing::info!(backend = store.backend_name(), "coordination store ready");

    let authority: Arc<dyn AuthorityApi> = Arc::new(
        HttpAuthority::new(
            &config.authority_url,
            &config.api_token,
            &config.application_name,
            config.upstream_timeout(),
        )
        .context("build authority client")?,
    );

    let mirror = Arc::new(TokenMirror::new(
        Arc::clone(&authority),
        Arc::clone(&store),
        config.change_channel.clone(),
    ));
    mirror
        .initialize(config.token_resync_interval())
        .await
        .context("token mirror startup")?;

    let cache = Arc::new(FlagCache::with_max_environments(
        Arc::clone(&authority),
        config.flag_cache_max_environments,
    ));
    let streaming = Arc::new(StreamingService::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        StreamingOptions {
            channel: config.change_channel.clone(),
            revision_keys: RevisionKeys::new(config.revision_prefix.clone()),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            stale_sweep_interval: Duration::from_millis(config.stale_sweep_interval_ms),
        },
    ));
    streaming.start().await;

    let metrics = Arc::new(MetricsAggregator::new(Arc::clone(&authority)));
    let usage = Arc::new(UsageTracker::new(
        Arc::clone(&authority),
        config.instance_id.clone(),
    ));
    let flush_task =
        metrics.spawn_flush_loop(Duration::from_millis(config.metrics_flush_interval_ms));
    let report_task =
        usage.spawn_report_loop(Duration::from_millis(config.usage_report_interval_ms));

    let state = AppState {
        mirror: Arc::clone(&mirror),
        cache,
        streaming: Arc::clone(&streaming),
        metrics: Arc::clone(&metrics),
        usage: Arc::clone(&usage),
        stream_queue_capacity: config.stream_queue_capacity,
    };

    let internal_listener = tokio::net::TcpListener::bind(config.internal_bind)
        .await
        .context("bind internal listener")?;
    let internal_app = build_internal_router(state.clone());
    tracing::info!(addr = %internal_listener.local_addr()?, "internal api listening");
    let internal_task = tokio::spawn(async move {
        if let Err(err) = axum::serve(internal_listener, internal_app.into_make_service()).await {
            tracing::warn!(error = %err, "internal api exited");
        }
    });

    let listener = tokio::net::TcpListener::bind(config.http_bind)
        .await
        .context("bind public listener")?;
    tracing::info!(
        addr = %listener.local_addr()?,
        instance_id = %config.instance_id,
        tokens = mirror.len(),
        "edge listening"
    );
    readiness.mark_ready();

    let app = build_router(state);
    tokio::pin!(shutdown);
    let served = tokio::select! {
        result = axum::serve(listener, app.into_make_service()) => {
            result.context("public api exited")
        }
        _ = &mut shutdown => Ok(()),
    };

    readiness.mark_not_ready();
    flush_task.abort();
    report_task.abort();
    // Last drain so buffered telemetry is not lost on a clean stop.
    metrics.flush().await;
    if let Err(err) = usage.report().await {
        tracing::warn!(error = %err, "final usage report failed");
    }
    streaming.shutdown();
    mirror.shutdown();
    internal_task.abort();
    metrics_task.abort();
    let _ = internal_task.await;
    let _ = metrics_task.await;
    tracing::info!("edge stopped");
    served
}
