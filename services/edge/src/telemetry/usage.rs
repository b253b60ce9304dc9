// Per-token usage counters reported upstream on a timer.
// A failed report merges the in-flight snapshot back into the live map, so
// usage is reported at least once.
use crate::authority::{AuthorityApi, TokenUsageEntry, TokenUsageReport};
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageStats {
    pub count: u64,
    pub last_used_at: DateTime<Utc>,
}

impl UsageStats {
    fn merge(&mut self, other: UsageStats) {
        self.count += other.count;
        self.last_used_at = self.last_used_at.max(other.last_used_at);
    }
}

pub struct UsageTracker {
    authority: Arc<dyn AuthorityApi>,
    instance_id: String,
    usage: Mutex<HashMap<u64, UsageStats>>,
}

impl UsageTracker {
    pub fn new(authority: Arc<dyn AuthorityApi>, instance_id: impl Into<String>) -> Self {
        Self {
            authority,
            instance_id: instance_id.into(),
            usage: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_usage(&self, token_id: u64) {
        self.record_usage_at(token_id, Utc::now());
    }

    pub fn record_usage_at(&self, token_id: u64, at: DateTime<Utc>) {
        // Id 0 is the synthesized unsecured token.
        if token_id == 0 {
            return;
        }
        self.usage
            .lock()
            .entry(token_id)
            .and_modify(|stats| {
                stats.count += 1;
                stats.last_used_at = stats.last_used_at.max(at);
            })
            .or_insert(UsageStats {
                count: 1,
                last_used_at: at,
            });
    }

    pub fn pending(&self) -> usize {
        self.usage.lock().len()
    }

    pub fn stats_for(&self, token_id: u64) -> Option<UsageStats> {
        self.usage.lock().get(&token_id).copied()
    }

    /// Report and clear the live counters. Returns how many tokens were
    /// reported.
    ///
    /// # Errors
    /// Returns the upstream error after restoring the snapshot.
    pub async fn report(&self) -> Result<usize> {
        let snapshot = std::mem::take(&mut *self.usage.lock());
        if snapshot.is_empty() {
            return Ok(0);
        }
        let mut usages: Vec<TokenUsageEntry> = snapshot
            .iter()
            .map(|(token_id, stats)| TokenUsageEntry {
                token_id: *token_id,
                usage_count: stats.count,
                last_used_at: stats.last_used_at,
            })
            .collect();
        usages.sort_by_key(|entry| entry.token_id);
        let report = TokenUsageReport {
            edge_instance_id: self.instance_id.clone(),
            usages,
        };
        match self.authority.report_token_usage(&report).await {
            Ok(()) => {
                metrics::counter!("edge_usage_reports_total", "result" => "ok").increment(1);
                tracing::debug!(tokens = snapshot.len(), "token usage reported");
                Ok(snapshot.len())
            }
            Err(err) => {
                metrics::counter!("edge_usage_reports_total", "result" => "error").increment(1);
                tracing::warn!(
                    tokens = snapshot.len(),
                    error = %err,
                    "token usage report failed; keeping counts for next cycle"
                );
                self.restore(snapshot);
                Err(err)
            }
        }
    }

    fn restore(&self, snapshot: HashMap<u64, UsageStats>) {
        let mut live = self.usage.lock();
        for (token_id, stats) in snapshot {
            live.entry(token_id)
                .and_modify(|current| current.merge(stats))
                .or_insert(stats);
        }
    }

    pub fn spawn_report_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let tracker: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(tracker) = tracker.upgrade() else {
                    return;
                };
                // Failures are logged and restored inside report.
                let _ = tracker.report().await;
            }
        })
    }
}
