//! Flag evaluation metrics buffered per (environment, application).
//!
//! Repeated reports coalesce in memory so one flush window costs one upstream
//! call per group and kind, however many SDKs reported into it.
use crate::authority::AuthorityApi;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleCounts {
    #[serde(default)]
    pub enabled: u64,
    #[serde(default)]
    pub disabled: u64,
    #[serde(default)]
    pub variants: HashMap<String, u64>,
}

impl ToggleCounts {
    fn merge(&mut self, other: &ToggleCounts) {
        self.enabled += other.enabled;
        self.disabled += other.disabled;
        for (variant, count) in &other.variants {
            *self.variants.entry(variant.clone()).or_insert(0) += count;
        }
    }
}

/// Client-reported evaluation counts for the window `[start, stop)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetricsBucket {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    #[serde(default)]
    pub toggles: HashMap<String, ToggleCounts>,
    #[serde(default)]
    pub missing: HashMap<String, u64>,
}

impl ClientMetricsBucket {
    fn merge(&mut self, other: &ClientMetricsBucket) {
        self.start = self.start.min(other.start);
        self.stop = self.stop.max(other.stop);
        for (flag, counts) in &other.toggles {
            self.toggles.entry(flag.clone()).or_default().merge(counts);
        }
        for (flag, count) in &other.missing {
            *self.missing.entry(flag.clone()).or_insert(0) += count;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetricEntry {
    pub flag_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default = "one")]
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnknownFlagReport {
    pub flag_name: String,
    pub count: u64,
}

fn one() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct GroupKey {
    environment: String,
    application: String,
}

impl GroupKey {
    fn new(environment: &str, application: &str) -> Self {
        Self {
            environment: environment.to_string(),
            application: application.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ServerKey {
    flag_name: String,
    enabled: bool,
    variant: Option<String>,
}

#[derive(Debug, Default)]
struct Buffers {
    client: HashMap<GroupKey, ClientMetricsBucket>,
    server: HashMap<GroupKey, HashMap<ServerKey, u64>>,
    unknown: HashMap<GroupKey, HashMap<String, u64>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub sent: usize,
    pub failed: usize,
}

impl FlushSummary {
    fn record(&mut self, kind: &'static str, ok: bool) {
        let result = if ok {
            self.sent += 1;
            "ok"
        } else {
            self.failed += 1;
            "error"
        };
        metrics::counter!("edge_metrics_flush_total", "kind" => kind, "result" => result)
            .increment(1);
    }
}

pub struct MetricsAggregator {
    authority: Arc<dyn AuthorityApi>,
    buffers: Mutex<Buffers>,
}

impl MetricsAggregator {
    pub fn new(authority: Arc<dyn AuthorityApi>) -> Self {
        Self {
            authority,
            buffers: Mutex::new(Buffers::default()),
        }
    }

    pub fn add_client_metrics(&self, environment: &str, application: &str, bucket: ClientMetricsBucket) {
        let key = GroupKey::new(environment, application);
        let mut buffers = self.buffers.lock();
        match buffers.client.get_mut(&key) {
            Some(existing) => existing.merge(&bucket),
            None => {
                buffers.client.insert(key, bucket);
            }
        }
    }

    pub fn add_server_metrics(
        &self,
        environment: &str,
        application: &str,
        entries: Vec<ServerMetricEntry>,
    ) {
        if entries.is_empty() {
            return;
        }
        let mut buffers = self.buffers.lock();
        let group = buffers
            .server
            .entry(GroupKey::new(environment, application))
            .or_default();
        for entry in entries {
            let key = ServerKey {
                flag_name: entry.flag_name,
                enabled: entry.enabled,
                variant: entry.variant,
            };
            *group.entry(key).or_insert(0) += entry.count;
        }
    }

    pub fn add_server_unknown_report(
        &self,
        environment: &str,
        application: &str,
        flag_name: &str,
        count: u64,
    ) {
        let mut buffers = self.buffers.lock();
        *buffers
            .unknown
            .entry(GroupKey::new(environment, application))
            .or_default()
            .entry(flag_name.to_string())
            .or_insert(0) += count;
    }

    /// Distinct (environment, application) groups waiting for a flush.
    pub fn pending_groups(&self) -> usize {
        let buffers = self.buffers.lock();
        let groups: HashSet<&GroupKey> = buffers
            .client
            .keys()
            .chain(buffers.server.keys())
            .chain(buffers.unknown.keys())
            .collect();
        groups.len()
    }

    /// Send everything buffered so far. The buffers are swapped out before any
    /// call is made; a failed group is dropped for this window.
    pub async fn flush(&self) -> FlushSummary {
        let Buffers {
            client,
            server,
            unknown,
        } = std::mem::take(&mut *self.buffers.lock());
        let mut summary = FlushSummary::default();

        let mut client: Vec<_> = client.into_iter().collect();
        client.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, bucket) in client {
            let result = self
                .authority
                .send_client_metrics(&key.environment, &key.application, &bucket)
                .await;
            if let Err(err) = &result {
                tracing::warn!(
                    environment = %key.environment,
                    application = %key.application,
                    error = %err,
                    "client metrics flush failed; dropping window"
                );
            }
            summary.record("client", result.is_ok());
        }

        let mut server: Vec<_> = server.into_iter().collect();
        server.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, counts) in server {
            let mut entries: Vec<ServerMetricEntry> = counts
                .into_iter()
                .map(|(entry, count)| ServerMetricEntry {
                    flag_name: entry.flag_name,
                    enabled: entry.enabled,
                    variant: entry.variant,
                    count,
                })
                .collect();
            entries.sort_by(|a, b| {
                (&a.flag_name, a.enabled, &a.variant).cmp(&(&b.flag_name, b.enabled, &b.variant))
            });
            let result = self
                .authority
                .send_server_metrics(&key.environment, &key.application, &entries)
                .await;
            if let Err(err) = &result {
                tracing::warn!(
                    environment = %key.environment,
                    application = %key.application,
                    error = %err,
                    "server metrics flush failed; dropping window"
                );
            }
            summary.record("server", result.is_ok());
        }

        let mut unknown: Vec<_> = unknown.into_iter().collect();
        unknown.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, counts) in unknown {
            let mut reports: Vec<UnknownFlagReport> = counts
                .into_iter()
                .map(|(flag_name, count)| UnknownFlagReport { flag_name, count })
                .collect();
            reports.sort_by(|a, b| a.flag_name.cmp(&b.flag_name));
            let result = self
                .authority
                .send_unknown_flags(&key.environment, &key.application, &reports)
                .await;
            if let Err(err) = &result {
                tracing::warn!(
                    environment = %key.environment,
                    application = %key.application,
                    error = %err,
                    "unknown flag report failed; dropping window"
                );
            }
            summary.record("unknown", result.is_ok());
        }

        if summary.sent + summary.failed > 0 {
            tracing::debug!(sent = summary.sent, failed = summary.failed, "metrics flushed");
        }
        summary
    }

    pub fn spawn_flush_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let aggregator: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(aggregator) = aggregator.upgrade() else {
                    return;
                };
                aggregator.flush().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeAuthority;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn bucket(start: i64, stop: i64, flag: &str, enabled: u64, disabled: u64) -> ClientMetricsBucket {
        let mut toggles = HashMap::new();
        toggles.insert(
            flag.to_string(),
            ToggleCounts {
                enabled,
                disabled,
                variants: HashMap::from([("blue".to_string(), enabled)]),
            },
        );
        ClientMetricsBucket {
            start: at(start),
            stop: at(stop),
            toggles,
            missing: HashMap::from([("ghost".to_string(), 1)]),
        }
    }

    #[tokio::test]
    async fn client_buckets_for_same_group_are_summed() {
        let authority = Arc::new(FakeAuthority::default());
        let aggregator = MetricsAggregator::new(authority.clone());
        aggregator.add_client_metrics("prod", "web", bucket(10, 20, "checkout", 3, 1));
        aggregator.add_client_metrics("prod", "web", bucket(5, 15, "checkout", 2, 4));
        assert_eq!(aggregator.pending_groups(), 1);

        let summary = aggregator.flush().await;
        assert_eq!(summary, FlushSummary { sent: 1, failed: 0 });
        let sent = authority.client_metrics.lock();
        assert_eq!(sent.len(), 1);
        let (environment, application, merged) = &sent[0];
        assert_eq!((environment.as_str(), application.as_str()), ("prod", "web"));
        assert_eq!(merged.start, at(5));
        assert_eq!(merged.stop, at(20));
        let counts = &merged.toggles["checkout"];
        assert_eq!((counts.enabled, counts.disabled), (5, 5));
        assert_eq!(counts.variants["blue"], 5);
        assert_eq!(merged.missing["ghost"], 2);
    }

    #[tokio::test]
    async fn groups_stay_separate() {
        let authority = Arc::new(FakeAuthority::default());
        let aggregator = MetricsAggregator::new(authority.clone());
        aggregator.add_client_metrics("prod", "web", bucket(0, 1, "a", 1, 0));
        aggregator.add_client_metrics("prod", "ios", bucket(0, 1, "a", 1, 0));
        aggregator.add_client_metrics("dev", "web", bucket(0, 1, "a", 1, 0));
        assert_eq!(aggregator.pending_groups(), 3);
        assert_eq!(aggregator.flush().await.sent, 3);
    }

    #[tokio::test]
    async fn server_entries_coalesce_by_flag_state_and_variant() {
        let authority = Arc::new(FakeAuthority::default());
        let aggregator = MetricsAggregator::new(authority.clone());
        let entry = |enabled: bool, variant: Option<&str>, count: u64| ServerMetricEntry {
            flag_name: "search".to_string(),
            enabled,
            variant: variant.map(str::to_string),
            count,
        };
        aggregator.add_server_metrics("prod", "api", vec![entry(true, None, 2), entry(false, None, 1)]);
        aggregator.add_server_metrics("prod", "api", vec![entry(true, None, 3), entry(true, Some("v2"), 1)]);
        aggregator.add_server_unknown_report("prod", "api", "ghost", 1);
        aggregator.add_server_unknown_report("prod", "api", "ghost", 1);
        assert_eq!(aggregator.pending_groups(), 1);

        let summary = aggregator.flush().await;
        assert_eq!(summary.sent, 2);
        let server = authority.server_metrics.lock();
        assert_eq!(
            server[0].2,
            vec![entry(false, None, 1), entry(true, None, 5), entry(true, Some("v2"), 1)]
        );
        let unknown = authority.unknown_flags.lock();
        assert_eq!(
            unknown[0].2,
            vec![UnknownFlagReport {
                flag_name: "ghost".to_string(),
                count: 2
            }]
        );
    }

    #[tokio::test]
    async fn failed_flush_drops_the_window() {
        let authority = Arc::new(FakeAuthority::default());
        let aggregator = MetricsAggregator::new(authority.clone());
        aggregator.add_client_metrics("prod", "web", bucket(0, 1, "a", 1, 0));
        authority.fail_metrics(true);

        let summary = aggregator.flush().await;
        assert_eq!(summary, FlushSummary { sent: 0, failed: 1 });
        assert_eq!(aggregator.pending_groups(), 0);

        authority.fail_metrics(false);
        assert_eq!(aggregator.flush().await, FlushSummary::default());
        assert!(authority.client_metrics.lock().is_empty());
    }

    #[test]
    fn server_entry_count_defaults_to_one() {
        let entry: ServerMetricEntry =
            serde_json::from_str(r#"{"flagName":"a","enabled":true}"#).expect("json");
        assert_eq!(entry.count, 1);
        assert_eq!(entry.variant, None);
    }

    #[tokio::test]
    async fn flush_loop_drains_on_timer() {
        let authority = Arc::new(FakeAuthority::default());
        let aggregator = Arc::new(MetricsAggregator::new(authority.clone()));
        let handle = aggregator.spawn_flush_loop(Duration::from_millis(20));
        aggregator.add_server_unknown_report("prod", "api", "ghost", 1);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while authority.unknown_flags.lock().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "flush loop never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
    }
}
