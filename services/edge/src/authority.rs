// Client for the central authority's HTTP API.
// Every call carries the instance credential and application header and is
// bounded by the client-level timeout, so a dead authority never stalls a
// flush or report cycle.
use crate::telemetry::metrics::{ClientMetricsBucket, ServerMetricEntry, UnknownFlagReport};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edge_tokens::MirroredToken;
use reqwest::Url;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const API_TOKEN_HEADER: &str = "x-api-token";
pub const APPLICATION_NAME_HEADER: &str = "x-application-name";

#[derive(Debug, Deserialize)]
struct TokensResponse {
    tokens: Vec<MirroredToken>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageEntry {
    pub token_id: u64,
    pub usage_count: u64,
    pub last_used_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageReport {
    pub edge_instance_id: String,
    pub usages: Vec<TokenUsageEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetricsPayload {
    pub app_name: String,
    pub bucket: ClientMetricsBucket,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetricsPayload {
    pub app_name: String,
    pub metrics: Vec<ServerMetricEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnknownFlagsPayload {
    pub app_name: String,
    pub flags: Vec<UnknownFlagReport>,
}

#[async_trait]
pub trait AuthorityApi: Send + Sync {
    async fn fetch_tokens(&self) -> Result<Vec<MirroredToken>>;
    async fn fetch_environment_flags(&self, environment: &str) -> Result<serde_json::Value>;
    async fn report_token_usage(&self, report: &TokenUsageReport) -> Result<()>;
    async fn send_client_metrics(
        &self,
        environment: &str,
        application: &str,
        bucket: &ClientMetricsBucket,
    ) -> Result<()>;
    async fn send_server_metrics(
        &self,
        environment: &str,
        application: &str,
        entries: &[ServerMetricEntry],
    ) -> Result<()>;
    async fn send_unknown_flags(
        &self,
        environment: &str,
        application: &str,
        reports: &[UnknownFlagReport],
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct HttpAuthority {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpAuthority {
    pub fn new(
        base_url: &str,
        api_token: &str,
        application_name: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            API_TOKEN_HEADER,
            HeaderValue::from_str(api_token).context("api token header value")?,
        );
        headers.insert(
            APPLICATION_NAME_HEADER,
            HeaderValue::from_str(application_name).context("application name header value")?,
        );
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("build authority http client")?;
        let base_url = Url::parse(base_url)
            .with_context(|| format!("parse authority url {base_url}"))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("authority url {base_url} cannot carry a path");
        }
        Ok(Self { base_url, client })
    }

    /// Append `segments` to the base path. Each segment is percent-encoded, so
    /// caller-supplied values such as environment names stay one segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        op: &'static str,
        url: Url,
        body: &T,
    ) -> Result<()> {
        let result = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("{op} request"))
            .and_then(|response| {
                response
                    .error_for_status()
                    .with_context(|| format!("{op} status"))
            });
        record_call(op, result.is_ok());
        result.map(|_| ())
    }
}

impl HttpAuthority {
    fn metrics_url(&self, environment: &str, kind: &str) -> Url {
        self.url(&["api", "v1", "edge", "environments", environment, "metrics", kind])
    }
}

fn record_call(op: &'static str, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    metrics::counter!("edge_authority_requests_total", "op" => op, "result" => result).increment(1);
}

#[async_trait]
impl AuthorityApi for HttpAuthority {
    async fn fetch_tokens(&self) -> Result<Vec<MirroredToken>> {
        let response = self
            .client
            .get(self.url(&["api", "v1", "edge", "tokens"]))
            .send()
            .await
            .context("tokens request")
            .and_then(|response| response.error_for_status().context("tokens status"));
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                record_call("fetch_tokens", false);
                return Err(err);
            }
        };
        let body: Result<TokensResponse> = response.json().await.context("tokens body");
        record_call("fetch_tokens", body.is_ok());
        Ok(body?.tokens)
    }

    async fn fetch_environment_flags(&self, environment: &str) -> Result<serde_json::Value> {
        let url = self.url(&["api", "v1", "edge", "environments", environment, "flags"]);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("environment flags request")
            .and_then(|response| {
                response
                    .error_for_status()
                    .context("environment flags status")
            });
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                record_call("fetch_flags", false);
                return Err(err);
            }
        };
        let body = response.json().await.context("environment flags body");
        record_call("fetch_flags", body.is_ok());
        body
    }

    async fn report_token_usage(&self, report: &TokenUsageReport) -> Result<()> {
        let url = self.url(&["api", "v1", "edge", "token-usage"]);
        self.post_json("token_usage", url, report).await
    }

    async fn send_client_metrics(
        &self,
        environment: &str,
        application: &str,
        bucket: &ClientMetricsBucket,
    ) -> Result<()> {
        let payload = ClientMetricsPayload {
            app_name: application.to_string(),
            bucket: bucket.clone(),
        };
        let url = self.metrics_url(environment, "client");
        self.post_json("client_metrics", url, &payload).await
    }

    async fn send_server_metrics(
        &self,
        environment: &str,
        application: &str,
        entries: &[ServerMetricEntry],
    ) -> Result<()> {
        let payload = ServerMetricsPayload {
            app_name: application.to_string(),
            metrics: entries.to_vec(),
        };
        let url = self.metrics_url(environment, "server");
        self.post_json("server_metrics", url, &payload).await
    }

    async fn send_unknown_flags(
        &self,
        environment: &str,
        application: &str,
        reports: &[UnknownFlagReport],
    ) -> Result<()> {
        let payload = UnknownFlagsPayload {
            app_name: application.to_string(),
            flags: reports.to_vec(),
        };
        let url = self.metrics_url(environment, "unknown");
        self.post_json("unknown_flags", url, &payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn start_server(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        format!("http://{addr}")
    }

    fn authority(base_url: &str) -> HttpAuthority {
        HttpAuthority::new(base_url, "edge-secret", "edge-test", Duration::from_secs(2))
            .expect("authority")
    }

    #[tokio::test]
    async fn fetch_tokens_sends_instance_headers() {
        let seen = Arc::new(Mutex::new(None::<(String, String)>));
        let seen_handler = Arc::clone(&seen);
        let app = Router::new().route(
            "/api/v1/edge/tokens",
            axum::routing::get(move |headers: AxumHeaders| {
                let seen = Arc::clone(&seen_handler);
                async move {
                    let token = headers
                        .get(API_TOKEN_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let app = headers
                        .get(APPLICATION_NAME_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    *seen.lock() = Some((token, app));
                    Json(serde_json::json!({
                        "tokens": [{
                            "id": 1,
                            "tokenValue": "srv-1",
                            "tokenType": "server",
                            "environments": ["prod"],
                            "createdAt": "2024-01-01T00:00:00Z",
                            "updatedAt": "2024-01-01T00:00:00Z"
                        }]
                    }))
                }
            }),
        );
        let base_url = start_server(app).await;
        let tokens = authority(&base_url).fetch_tokens().await.expect("tokens");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].secret, "srv-1");
        assert_eq!(
            seen.lock().clone(),
            Some(("edge-secret".to_string(), "edge-test".to_string()))
        );
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let app = Router::new().fallback(|| async { StatusCode::INTERNAL_SERVER_ERROR });
        let base_url = start_server(app).await;
        let authority = authority(&base_url);
        assert!(authority.fetch_tokens().await.is_err());
        assert!(authority.fetch_environment_flags("prod").await.is_err());
        let report = TokenUsageReport {
            edge_instance_id: "edge-a".to_string(),
            usages: Vec::new(),
        };
        assert!(authority.report_token_usage(&report).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_authority_is_an_error() {
        let authority = authority("http://127.0.0.1:1");
        let err = authority.fetch_tokens().await.unwrap_err();
        assert!(err.to_string().contains("tokens request"));
    }

    #[tokio::test]
    async fn slow_authority_times_out() {
        let app = Router::new().fallback(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            StatusCode::OK
        });
        let base_url = start_server(app).await;
        let authority =
            HttpAuthority::new(&base_url, "t", "a", Duration::from_millis(100)).expect("authority");
        let started = std::time::Instant::now();
        assert!(authority.fetch_environment_flags("prod").await.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn usage_report_posts_camel_case_body() {
        let body = Arc::new(Mutex::new(None::<serde_json::Value>));
        let body_handler = Arc::clone(&body);
        let app = Router::new().route(
            "/api/v1/edge/token-usage",
            axum::routing::post(move |Json(value): Json<serde_json::Value>| {
                let body = Arc::clone(&body_handler);
                async move {
                    *body.lock() = Some(value);
                    StatusCode::ACCEPTED
                }
            }),
        );
        let base_url = start_server(app).await;
        let report = TokenUsageReport {
            edge_instance_id: "edge-a".to_string(),
            usages: vec![TokenUsageEntry {
                token_id: 7,
                usage_count: 3,
                last_used_at: Utc::now(),
            }],
        };
        authority(&base_url)
            .report_token_usage(&report)
            .await
            .expect("report");
        let sent = body.lock().clone().expect("body");
        assert_eq!(sent["edgeInstanceId"], "edge-a");
        assert_eq!(sent["usages"][0]["tokenId"], 7);
        assert_eq!(sent["usages"][0]["usageCount"], 3);
    }

    #[tokio::test]
    async fn environment_stays_one_path_segment() {
        let paths = Arc::new(Mutex::new(Vec::<String>::new()));
        let fallback_paths = Arc::clone(&paths);
        let app = Router::new()
            .route(
                "/api/v1/edge/tokens",
                axum::routing::get(|| async { Json(serde_json::json!({"tokens": ["leaked"]})) }),
            )
            .fallback(move |uri: axum::http::Uri| {
                let paths = Arc::clone(&fallback_paths);
                async move {
                    paths.lock().push(uri.path().to_string());
                    StatusCode::NOT_FOUND
                }
            });
        let base_url = start_server(app).await;
        let authority = authority(&base_url);

        assert!(authority.fetch_environment_flags("../tokens?").await.is_err());
        let bucket = ClientMetricsBucket {
            start: Utc::now(),
            stop: Utc::now(),
            toggles: Default::default(),
            missing: Default::default(),
        };
        assert!(
            authority
                .send_client_metrics("../../token-usage#", "app", &bucket)
                .await
                .is_err()
        );

        let paths = paths.lock().clone();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].starts_with("/api/v1/edge/environments/"), "{}", paths[0]);
        assert!(paths[0].contains("%2Ftokens%3F"), "{}", paths[0]);
        assert!(paths[0].ends_with("/flags"), "{}", paths[0]);
        assert!(paths[1].contains("%2Ftoken-usage%23"), "{}", paths[1]);
        assert!(paths[1].ends_with("/metrics/client"), "{}", paths[1]);
    }

    #[tokio::test]
    async fn base_url_path_prefix_is_kept() {
        let app = Router::new().route(
            "/authority/api/v1/edge/environments/prod/flags",
            axum::routing::get(|| async { Json(serde_json::json!({"features": []})) }),
        );
        let base_url = start_server(app).await;
        let authority = authority(&format!("{base_url}/authority/"));
        let flags = authority
            .fetch_environment_flags("prod")
            .await
            .expect("flags");
        assert_eq!(flags["features"], serde_json::json!([]));
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let result = HttpAuthority::new("not a url", "t", "a", Duration::from_secs(1));
        assert!(result.is_err());
    }

    #[test]
    fn invalid_header_value_is_rejected() {
        let result = HttpAuthority::new("http://x", "bad\ntoken", "app", Duration::from_secs(1));
        assert!(result.is_err());
    }
}
