//! HTTP handlers for the market-data endpoints.
//!
//! Each handler only builds a fingerprint from the request and serializes
//! whatever the gateway resolves; caching decisions live in the gateway.

use crate::cache::{Fingerprint, Gateway, Resolved, ServedAs};
use crate::error::GatewayError;
use crate::upstream::JsonPayload;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;

static SYMBOL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z0-9.^=-]{1,16}$").unwrap());
static WINDOW_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]{1,3}[dwmy]$").unwrap());

const DEFAULT_HISTORY_WINDOW: &str = "1m";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway<JsonPayload>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    window: Option<String>,
}

pub async fn indices_handler(State(state): State<AppState>) -> Response {
    serve(&state, Fingerprint::new("indices")).await
}

pub async fn quote_handler(State(state): State<AppState>, Path(symbol): Path<String>) -> Response {
    let symbol = match normalize_symbol(&symbol) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    serve(&state, Fingerprint::with_params("quote", [("symbol", symbol)])).await
}

pub async fn history_handler(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let symbol = match normalize_symbol(&symbol) {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    let window = params
        .window
        .map(|w| w.trim().to_lowercase())
        .unwrap_or_else(|| DEFAULT_HISTORY_WINDOW.to_string());
    if !WINDOW_RE.is_match(&window) {
        return bad_request(&format!("invalid history window {:?}", window));
    }

    serve(
        &state,
        Fingerprint::with_params("history", [("symbol", symbol), ("window", window)]),
    )
    .await
}

/// Health check endpoint
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.gateway.stats();

    // An empty cache is expected right after boot; it fills on first access
    let status = if stats.entries > 0 && stats.stale_entries == stats.entries {
        "degraded"
    } else {
        "healthy"
    };

    Json(json!({
        "status": status,
        "entries": stats.entries,
        "stale_entries": stats.stale_entries,
        "in_flight": stats.in_flight,
        "started_at": state.started_at.to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Metrics endpoint handler
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.gateway.metrics();
    metrics.update_cache_metrics(&state.gateway.stats());

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render(),
    )
}

async fn serve(state: &AppState, fingerprint: Fingerprint) -> Response {
    match state.gateway.resolve(&fingerprint).await {
        Ok(resolved) => render_resolved(resolved, Utc::now()),
        Err(err) => render_error(&err),
    }
}

fn render_resolved(resolved: Resolved<JsonPayload>, now: DateTime<Utc>) -> Response {
    let as_of = chrono::Duration::from_std(resolved.age)
        .map(|age| now - age)
        .unwrap_or(now);
    let cache_header = match resolved.served_as {
        ServedAs::Fresh => "FRESH",
        ServedAs::Stale => "STALE",
        ServedAs::Cold => "COLD",
    };

    let body = json!({
        "data": &*resolved.payload,
        "served_as": resolved.served_as.as_str(),
        "as_of": as_of.to_rfc3339(),
    });

    let mut response = Json(body).into_response();
    response
        .headers_mut()
        .insert("x-cache", HeaderValue::from_static(cache_header));
    response
}

fn render_error(err: &GatewayError) -> Response {
    let kind = err.upstream_kind().map(|k| k.as_str()).unwrap_or("internal");
    let body = json!({
        "error": "no data available",
        "kind": kind,
    });
    (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
}

fn normalize_symbol(raw: &str) -> Result<String, Response> {
    let symbol = raw.trim().to_uppercase();
    if SYMBOL_RE.is_match(&symbol) {
        Ok(symbol)
    } else {
        Err(bad_request(&format!("invalid symbol {:?}", raw)))
    }
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::GatewayConfig;
    use crate::error::UpstreamError;
    use crate::metrics::Metrics;
    use crate::upstream::Upstream;
    use futures::future::{BoxFuture, FutureExt};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Upstream that answers every fetch the same way and remembers what it was asked
    struct FixedUpstream {
        response: Result<JsonPayload, UpstreamError>,
        seen: Mutex<Vec<Fingerprint>>,
    }

    impl Upstream<JsonPayload> for FixedUpstream {
        fn fetch(&self, fingerprint: &Fingerprint) -> BoxFuture<'static, Result<JsonPayload, UpstreamError>> {
            self.seen.lock().unwrap().push(fingerprint.clone());
            let response = self.response.clone();
            async move { response }.boxed()
        }
    }

    fn state(response: Result<JsonPayload, UpstreamError>) -> (AppState, Arc<FixedUpstream>) {
        let upstream = Arc::new(FixedUpstream {
            response,
            seen: Mutex::new(Vec::new()),
        });
        let config = GatewayConfig {
            ttl: Duration::from_secs(60),
            rate_limit_cooldown: Duration::from_secs(60),
            max_entries: None,
        };
        let gateway = Gateway::new(
            &config,
            upstream.clone(),
            HashMap::new(),
            Arc::new(Metrics::new().unwrap()),
        );
        let state = AppState {
            gateway,
            started_at: Utc::now(),
        };
        (state, upstream)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_symbol_normalization() {
        assert_eq!(normalize_symbol(" aapl ").unwrap(), "AAPL");
        assert_eq!(normalize_symbol("^gspc").unwrap(), "^GSPC");
        assert_eq!(normalize_symbol("brk.b").unwrap(), "BRK.B");
        assert!(normalize_symbol("").is_err());
        assert!(normalize_symbol("AAPL&window=1y").is_err());
        assert!(normalize_symbol("WAYTOOLONGSYMBOLNAME").is_err());
    }

    #[test]
    fn test_window_pattern() {
        assert!(WINDOW_RE.is_match("1m"));
        assert!(WINDOW_RE.is_match("365d"));
        assert!(!WINDOW_RE.is_match("1h"));
        assert!(!WINDOW_RE.is_match("forever"));
    }

    #[tokio::test]
    async fn test_render_resolved_body() {
        let now = Utc::now();
        let resolved = Resolved {
            payload: Arc::new(json!({"price": 1.5})),
            served_as: ServedAs::Stale,
            age: Duration::from_secs(90),
        };

        let response = render_resolved(resolved, now);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "STALE");

        let body = body_json(response).await;
        assert_eq!(body["data"], json!({"price": 1.5}));
        assert_eq!(body["served_as"], "stale");
        assert_eq!(
            body["as_of"],
            (now - chrono::Duration::seconds(90)).to_rfc3339()
        );
    }

    #[tokio::test]
    async fn test_quote_served_cold_then_fresh() {
        let (state, upstream) = state(Ok(Arc::new(json!({"symbol": "AAPL", "price": 190.1}))));

        let response = quote_handler(State(state.clone()), Path("aapl".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "COLD");
        let body = body_json(response).await;
        assert_eq!(body["data"]["price"], 190.1);
        assert_eq!(body["served_as"], "cold");
        assert!(DateTime::parse_from_rfc3339(body["as_of"].as_str().unwrap()).is_ok());

        let response = quote_handler(State(state), Path("AAPL".to_string())).await;
        assert_eq!(response.headers()["x-cache"], "FRESH");
        assert_eq!(body_json(response).await["served_as"], "fresh");

        let seen = upstream.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].as_str(), "quote?symbol=AAPL");
    }

    #[tokio::test]
    async fn test_history_defaults_window() {
        let (state, upstream) = state(Ok(Arc::new(json!([1.0, 2.0]))));

        let response = history_handler(
            State(state),
            Path("msft".to_string()),
            Query(HistoryParams { window: None }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let seen = upstream.seen.lock().unwrap();
        assert_eq!(
            seen[0],
            Fingerprint::with_params("history", [("symbol", "MSFT"), ("window", "1m")])
        );
    }

    #[tokio::test]
    async fn test_history_rejects_invalid_window() {
        let (state, upstream) = state(Ok(Arc::new(json!([]))));

        let response = history_handler(
            State(state),
            Path("MSFT".to_string()),
            Query(HistoryParams {
                window: Some("1h".to_string()),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("invalid history window"));
        assert!(upstream.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_data_body() {
        let (state, _) = state(Err(UpstreamError::RateLimited { retry_after: None }));

        let response = indices_handler(State(state)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body_json(response).await,
            json!({"error": "no data available", "kind": "rate_limited"})
        );
    }
}
