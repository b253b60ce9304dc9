// Per-environment read-through cache of flag snapshots.
// Streaming refreshes an environment here before it notifies clients, so a
// client that refetches on the signal reads the new data.
use crate::authority::AuthorityApi;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct CachedFlags {
    payload: Arc<serde_json::Value>,
    refreshed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntrySummary {
    pub environment: String,
    pub refreshed_at: DateTime<Utc>,
    pub entries: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshOutcome {
    pub environment: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub const DEFAULT_MAX_ENVIRONMENTS: usize = 1024;

pub struct FlagCache {
    authority: Arc<dyn AuthorityApi>,
    entries: DashMap<String, CachedFlags>,
    max_environments: usize,
}

impl FlagCache {
    pub fn new(authority: Arc<dyn AuthorityApi>) -> Self {
        Self::with_max_environments(authority, DEFAULT_MAX_ENVIRONMENTS)
    }

    /// Holds at most `max_environments` snapshots; caching a new environment
    /// beyond that evicts the least recently refreshed one.
    pub fn with_max_environments(authority: Arc<dyn AuthorityApi>, max_environments: usize) -> Self {
        Self {
            authority,
            entries: DashMap::new(),
            max_environments: max_environments.max(1),
        }
    }

    /// Cached snapshot, fetched from the authority on a miss.
    pub async fn get(&self, environment: &str) -> Result<Arc<serde_json::Value>> {
        if let Some(entry) = self.entries.get(environment) {
            metrics::counter!("edge_flag_cache_requests_total", "result" => "hit").increment(1);
            return Ok(Arc::clone(&entry.payload));
        }
        metrics::counter!("edge_flag_cache_requests_total", "result" => "miss").increment(1);
        self.refresh(environment).await
    }

    pub async fn refresh(&self, environment: &str) -> Result<Arc<serde_json::Value>> {
        let payload = self
            .authority
            .fetch_environment_flags(environment)
            .await
            .with_context(|| format!("refresh flags for {environment}"))?;
        let payload = Arc::new(payload);
        if !self.entries.contains_key(environment) {
            self.evict_to_fit();
        }
        self.entries.insert(
            environment.to_string(),
            CachedFlags {
                payload: Arc::clone(&payload),
                refreshed_at: Utc::now(),
            },
        );
        tracing::debug!(environment = %environment, "flag cache refreshed");
        Ok(payload)
    }

    pub async fn refresh_all(&self) -> Vec<RefreshOutcome> {
        let mut environments: Vec<String> =
            self.entries.iter().map(|entry| entry.key().clone()).collect();
        environments.sort();
        let mut outcomes = Vec::with_capacity(environments.len());
        for environment in environments {
            let outcome = match self.refresh(&environment).await {
                Ok(_) => RefreshOutcome {
                    environment,
                    ok: true,
                    error: None,
                },
                Err(err) => {
                    tracing::warn!(environment = %environment, error = %err, "flag cache refresh failed");
                    RefreshOutcome {
                        environment,
                        ok: false,
                        error: Some(format!("{err:#}")),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    pub fn summary(&self) -> Vec<CacheEntrySummary> {
        let mut summary: Vec<CacheEntrySummary> = self
            .entries
            .iter()
            .map(|entry| CacheEntrySummary {
                environment: entry.key().clone(),
                refreshed_at: entry.refreshed_at,
                entries: payload_entries(&entry.payload),
            })
            .collect();
        summary.sort_by(|a, b| a.environment.cmp(&b.environment));
        summary
    }

    pub fn invalidate(&self, environment: &str) -> bool {
        self.entries.remove(environment).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_to_fit(&self) {
        while self.entries.len() >= self.max_environments {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.refreshed_at)
                .map(|entry| entry.key().clone());
            let Some(oldest) = oldest else {
                return;
            };
            self.entries.remove(&oldest);
            metrics::counter!("edge_flag_cache_evictions_total").increment(1);
            tracing::debug!(environment = %oldest, "flag cache entry evicted");
        }
    }
}

fn payload_entries(payload: &serde_json::Value) -> usize {
    match payload {
        serde_json::Value::Object(map) => map.len(),
        serde_json::Value::Array(items) => items.len(),
        serde_json::Value::Null => 0,
        _ => 1,
    }
}
