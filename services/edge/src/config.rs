use anyhow::{Context, Result};
use edge_coord::{DEFAULT_CHANGE_CHANNEL, DEFAULT_REVISION_PREFIX};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

// Edge service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    // Public SDK-facing API bind address.
    pub http_bind: SocketAddr,
    // Internal operational API bind address.
    pub internal_bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Authority base URL.
    pub authority_url: String,
    // Instance-level credential sent to the authority.
    pub api_token: String,
    // Application name header sent to the authority.
    pub application_name: String,
    // Identity of this edge process in usage reports.
    pub instance_id: String,
    // Coordination store URL; in-memory store when unset.
    pub redis_url: Option<String>,
    // Shared pub/sub channel carrying change events.
    pub change_channel: String,
    // Key prefix for per-environment revision counters.
    pub revision_prefix: String,
    // Timeout applied to every authority call.
    pub upstream_timeout_ms: u64,
    // Streaming heartbeat period.
    pub heartbeat_interval_ms: u64,
    // Streaming stale-connection sweep period.
    pub stale_sweep_interval_ms: u64,
    // Metrics aggregator flush period.
    pub metrics_flush_interval_ms: u64,
    // Token usage report period.
    pub usage_report_interval_ms: u64,
    // Periodic full token resync; 0 disables.
    pub token_resync_interval_ms: u64,
    // Per-connection outbound event queue depth.
    pub stream_queue_capacity: usize,
    // Upper bound on environments held in the flag cache.
    pub flag_cache_max_environments: usize,
}

const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
const DEFAULT_STALE_SWEEP_INTERVAL_MS: u64 = 60_000;
const DEFAULT_METRICS_FLUSH_INTERVAL_MS: u64 = 30_000;
const DEFAULT_USAGE_REPORT_INTERVAL_MS: u64 = 60_000;
const DEFAULT_STREAM_QUEUE_CAPACITY: usize = 64;
const DEFAULT_FLAG_CACHE_MAX_ENVIRONMENTS: usize = 1024;

#[derive(Debug, Deserialize)]
struct EdgeConfigOverride {
    http_bind: Option<String>,
    internal_bind: Option<String>,
    metrics_bind: Option<String>,
    authority_url: Option<String>,
    api_token: Option<String>,
    application_name: Option<String>,
    instance_id: Option<String>,
    redis_url: Option<String>,
    change_channel: Option<String>,
    revision_prefix: Option<String>,
    upstream_timeout_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    stale_sweep_interval_ms: Option<u64>,
    metrics_flush_interval_ms: Option<u64>,
    usage_report_interval_ms: Option<u64>,
    token_resync_interval_ms: Option<u64>,
    stream_queue_capacity: Option<usize>,
    flag_cache_max_environments: Option<usize>,
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

impl EdgeConfig {
    pub fn from_env() -> Result<Self> {
        let http_bind = std::env::var("EDGE_HTTP_BIND")
            .unwrap_or_else(|_| "0.0.0.0:3400".to_string())
            .parse()
            .with_context(|| "parse EDGE_HTTP_BIND")?;
        let internal_bind = std::env::var("EDGE_INTERNAL_BIND")
            .unwrap_or_else(|_| "127.0.0.1:3410".to_string())
            .parse()
            .with_context(|| "parse EDGE_INTERNAL_BIND")?;
        let metrics_bind = std::env::var("EDGE_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:9400".to_string())
            .parse()
            .with_context(|| "parse EDGE_METRICS_BIND")?;
        let authority_url = std::env::var("EDGE_AUTHORITY_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:5000".to_string());
        let api_token = std::env::var("EDGE_API_TOKEN").unwrap_or_default();
        let application_name =
            std::env::var("EDGE_APPLICATION_NAME").unwrap_or_else(|_| "flag-edge".to_string());
        let instance_id = std::env::var("EDGE_INSTANCE_ID")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
        let redis_url = std::env::var("EDGE_REDIS_URL")
            .ok()
            .filter(|value| !value.is_empty());
        let change_channel = std::env::var("EDGE_CHANGE_CHANNEL")
            .unwrap_or_else(|_| DEFAULT_CHANGE_CHANNEL.to_string());
        let revision_prefix = std::env::var("EDGE_REVISION_PREFIX")
            .unwrap_or_else(|_| DEFAULT_REVISION_PREFIX.to_string());
        // Zero is a meaningful value here, so it bypasses env_u64's filter.
        let token_resync_interval_ms = std::env::var("EDGE_TOKEN_RESYNC_INTERVAL_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        let stream_queue_capacity = std::env::var("EDGE_STREAM_QUEUE_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STREAM_QUEUE_CAPACITY);
        let flag_cache_max_environments = std::env::var("EDGE_FLAG_CACHE_MAX_ENVIRONMENTS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_FLAG_CACHE_MAX_ENVIRONMENTS);
        Ok(Self {
            http_bind,
            internal_bind,
            metrics_bind,
            authority_url,
            api_token,
            application_name,
            instance_id,
            redis_url,
            change_channel,
            revision_prefix,
            upstream_timeout_ms: env_u64("EDGE_UPSTREAM_TIMEOUT_MS", DEFAULT_UPSTREAM_TIMEOUT_MS),
            heartbeat_interval_ms: env_u64(
                "EDGE_HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            ),
            stale_sweep_interval_ms: env_u64(
                "EDGE_STALE_SWEEP_INTERVAL_MS",
                DEFAULT_STALE_SWEEP_INTERVAL_MS,
            ),
            metrics_flush_interval_ms: env_u64(
                "EDGE_METRICS_FLUSH_INTERVAL_MS",
                DEFAULT_METRICS_FLUSH_INTERVAL_MS,
            ),
            usage_report_interval_ms: env_u64(
                "EDGE_USAGE_REPORT_INTERVAL_MS",
                DEFAULT_USAGE_REPORT_INTERVAL_MS,
            ),
            token_resync_interval_ms,
            stream_queue_capacity,
            flag_cache_max_environments,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("EDGE_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read EDGE_CONFIG: {path}"))?;
            let override_cfg: EdgeConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse edge config yaml")?;
            config.apply(override_cfg)?;
        }
        Ok(config)
    }

    fn apply(&mut self, override_cfg: EdgeConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.http_bind {
            self.http_bind = value.parse().with_context(|| "parse http_bind")?;
        }
        if let Some(value) = override_cfg.internal_bind {
            self.internal_bind = value.parse().with_context(|| "parse internal_bind")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.authority_url {
            self.authority_url = value;
        }
        if let Some(value) = override_cfg.api_token {
            self.api_token = value;
        }
        if let Some(value) = override_cfg.application_name {
            self.application_name = value;
        }
        if let Some(value) = override_cfg.instance_id {
            self.instance_id = value;
        }
        if let Some(value) = override_cfg.redis_url {
            self.redis_url = Some(value).filter(|value| !value.is_empty());
        }
        if let Some(value) = override_cfg.change_channel {
            self.change_channel = value;
        }
        if let Some(value) = override_cfg.revision_prefix {
            self.revision_prefix = value;
        }
        if let Some(value) = override_cfg.upstream_timeout_ms
            && value > 0
        {
            self.upstream_timeout_ms = value;
        }
        if let Some(value) = override_cfg.heartbeat_interval_ms
            && value > 0
        {
            self.heartbeat_interval_ms = value;
        }
        if let Some(value) = override_cfg.stale_sweep_interval_ms
            && value > 0
        {
            self.stale_sweep_interval_ms = value;
        }
        if let Some(value) = override_cfg.metrics_flush_interval_ms
            && value > 0
        {
            self.metrics_flush_interval_ms = value;
        }
        if let Some(value) = override_cfg.usage_report_interval_ms
            && value > 0
        {
            self.usage_report_interval_ms = value;
        }
        if let Some(value) = override_cfg.token_resync_interval_ms {
            self.token_resync_interval_ms = value;
        }
        if let Some(value) = override_cfg.stream_queue_capacity
            && value > 0
        {
            self.stream_queue_capacity = value;
        }
        if let Some(value) = override_cfg.flag_cache_max_environments
            && value > 0
        {
            self.flag_cache_max_environments = value;
        }
        Ok(())
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn token_resync_interval(&self) -> Option<Duration> {
        (self.token_resync_interval_ms > 0)
            .then(|| Duration::from_millis(self.token_resync_interval_ms))
    }
}
