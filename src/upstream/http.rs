use crate::cache::fingerprint::Fingerprint;
use crate::cache::policy::MAX_COOLDOWN;
use crate::error::UpstreamError;
use crate::upstream::Upstream;
use futures::future::{BoxFuture, FutureExt};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, trace, warn};

/// Decoded provider response, shared between cache readers
pub type JsonPayload = Arc<Value>;

#[derive(Clone)]
pub struct HttpUpstream {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    api_key_param: String,
}

impl HttpUpstream {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            api_key_param: "apikey".to_string(),
        }
    }

    pub fn with_api_key(mut self, param: &str, key: Option<String>) -> Self {
        self.api_key_param = param.to_string();
        self.api_key = key;
        self
    }

    fn url_for(&self, fingerprint: &Fingerprint) -> String {
        format!("{}/{}", self.base_url, fingerprint.endpoint())
    }

    fn query_for(&self, fingerprint: &Fingerprint) -> Vec<(String, String)> {
        let mut query: Vec<(String, String)> = fingerprint
            .params()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(key) = &self.api_key {
            query.push((self.api_key_param.clone(), key.clone()));
        }
        query
    }

    /// Execute one GET and classify the outcome. No retries.
    #[instrument(skip(self, fingerprint), fields(fingerprint = %fingerprint))]
    async fn get_json(&self, fingerprint: &Fingerprint) -> Result<Value, UpstreamError> {
        let url = self.url_for(fingerprint);
        let start = Instant::now();

        debug!(url = %url, "Sending request to market-data provider");

        let resp = self
            .client
            .get(&url)
            .query(&self.query_for(fingerprint))
            .send()
            .await
            .map_err(|e| {
                debug!(
                    error = %e,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Request failed"
                );
                UpstreamError::Unavailable(e.to_string())
            })?;

        let status = resp.status();
        let elapsed_ms = start.elapsed().as_millis() as u64;

        if let Some(err) = classify_status(status, resp.headers()) {
            warn!(status = %status, elapsed_ms, error = %err, "Provider refused request");
            return Err(err);
        }

        let body = resp.bytes().await.map_err(UpstreamError::from)?;
        trace!(response_bytes = body.len(), "Response body received");

        let json = decode_body(&body)?;
        debug!(status = %status, elapsed_ms, "Request successful");
        Ok(json)
    }
}

impl Upstream<JsonPayload> for HttpUpstream {
    fn fetch(&self, fingerprint: &Fingerprint) -> BoxFuture<'static, Result<JsonPayload, UpstreamError>> {
        let this = self.clone();
        let fingerprint = fingerprint.clone();
        async move { this.get_json(&fingerprint).await.map(Arc::new) }.boxed()
    }
}

/// Map a non-success HTTP status to an upstream error
fn classify_status(status: StatusCode, headers: &HeaderMap) -> Option<UpstreamError> {
    if status.is_success() {
        return None;
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Some(UpstreamError::RateLimited {
            retry_after: headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after),
        });
    }

    Some(UpstreamError::Unavailable(format!("HTTP {}", status)))
}

/// Only the delay-seconds form is understood; HTTP-date values are ignored.
/// Hints are capped at [`MAX_COOLDOWN`].
fn parse_retry_after(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs).min(MAX_COOLDOWN))
}

fn decode_body(body: &[u8]) -> Result<Value, UpstreamError> {
    let json: Value = serde_json::from_slice(body)?;
    if json.is_null() {
        return Err(UpstreamError::MalformedResponse("empty response".into()));
    }
    Ok(json)
}
