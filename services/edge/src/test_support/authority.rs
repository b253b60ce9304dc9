// In-process authority double that records every call.
use crate::authority::{AuthorityApi, TokenUsageReport};
use crate::telemetry::metrics::{ClientMetricsBucket, ServerMetricEntry, UnknownFlagReport};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use edge_tokens::{MirroredToken, TokenType};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

type FetchHook = Box<dyn Fn() + Send + Sync>;

pub fn sample_token(id: u64, secret: &str, token_type: TokenType, envs: &[&str]) -> MirroredToken {
    let now = Utc::now();
    MirroredToken {
        id,
        secret: secret.to_string(),
        token_name: Some(format!("token-{id}")),
        token_type,
        allow_all_environments: false,
        environments: envs.iter().map(|env| env.to_string()).collect(),
        expires_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[derive(Default)]
pub struct FakeAuthority {
    pub tokens: Mutex<Vec<MirroredToken>>,
    pub flags: Mutex<HashMap<String, serde_json::Value>>,
    pub token_fetches: AtomicUsize,
    pub flag_fetches: Mutex<Vec<String>>,
    pub usage_reports: Mutex<Vec<TokenUsageReport>>,
    pub client_metrics: Mutex<Vec<(String, String, ClientMetricsBucket)>>,
    pub server_metrics: Mutex<Vec<(String, String, Vec<ServerMetricEntry>)>>,
    pub unknown_flags: Mutex<Vec<(String, String, Vec<UnknownFlagReport>)>>,
    pub fail_tokens: AtomicBool,
    pub fail_flags: AtomicBool,
    pub fail_usage: AtomicBool,
    pub fail_metrics: AtomicBool,
    on_token_fetch: Mutex<Option<FetchHook>>,
}

impl FakeAuthority {
    pub fn with_tokens(tokens: Vec<MirroredToken>) -> Self {
        let fake = Self::default();
        *fake.tokens.lock() = tokens;
        fake
    }

    pub fn set_tokens(&self, tokens: Vec<MirroredToken>) {
        *self.tokens.lock() = tokens;
    }

    pub fn set_flags(&self, environment: &str, snapshot: serde_json::Value) {
        self.flags.lock().insert(environment.to_string(), snapshot);
    }

    pub fn fail_tokens(&self, fail: bool) {
        self.fail_tokens.store(fail, Ordering::SeqCst);
    }

    pub fn fail_flags(&self, fail: bool) {
        self.fail_flags.store(fail, Ordering::SeqCst);
    }

    pub fn fail_usage(&self, fail: bool) {
        self.fail_usage.store(fail, Ordering::SeqCst);
    }

    pub fn fail_metrics(&self, fail: bool) {
        self.fail_metrics.store(fail, Ordering::SeqCst);
    }

    /// Runs `hook` inside every token fetch, before the response is built.
    pub fn on_token_fetch(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_token_fetch.lock() = Some(Box::new(hook));
    }

    pub fn token_fetch_count(&self) -> usize {
        self.token_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthorityApi for FakeAuthority {
    async fn fetch_tokens(&self) -> Result<Vec<MirroredToken>> {
        self.token_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.on_token_fetch.lock().as_ref() {
            hook();
        }
        if self.fail_tokens.load(Ordering::SeqCst) {
            return Err(anyhow!("authority unavailable"));
        }
        Ok(self.tokens.lock().clone())
    }

    async fn fetch_environment_flags(&self, environment: &str) -> Result<serde_json::Value> {
        self.flag_fetches.lock().push(environment.to_string());
        if self.fail_flags.load(Ordering::SeqCst) {
            return Err(anyhow!("authority unavailable"));
        }
        Ok(self
            .flags
            .lock()
            .get(environment)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "features": [] })))
    }

    async fn report_token_usage(&self, report: &TokenUsageReport) -> Result<()> {
        if self.fail_usage.load(Ordering::SeqCst) {
            return Err(anyhow!("authority unavailable"));
        }
        self.usage_reports.lock().push(report.clone());
        Ok(())
    }

    async fn send_client_metrics(
        &self,
        environment: &str,
        application: &str,
        bucket: &ClientMetricsBucket,
    ) -> Result<()> {
        if self.fail_metrics.load(Ordering::SeqCst) {
            return Err(anyhow!("authority unavailable"));
        }
        self.client_metrics.lock().push((
            environment.to_string(),
            application.to_string(),
            bucket.clone(),
        ));
        Ok(())
    }

    async fn send_server_metrics(
        &self,
        environment: &str,
        application: &str,
        entries: &[ServerMetricEntry],
    ) -> Result<()> {
        if self.fail_metrics.load(Ordering::SeqCst) {
            return Err(anyhow!("authority unavailable"));
        }
        self.server_metrics.lock().push((
            environment.to_string(),
            application.to_string(),
            entries.to_vec(),
        ));
        Ok(())
    }

    async fn send_unknown_flags(
        &self,
        environment: &str,
        application: &str,
        reports: &[UnknownFlagReport],
    ) -> Result<()> {
        if self.fail_metrics.load(Ordering::SeqCst) {
            return Err(anyhow!("authority unavailable"));
        }
        self.unknown_flags.lock().push((
            environment.to_string(),
            application.to_string(),
            reports.to_vec(),
        ));
        Ok(())
    }
}
