//! Quotegate - caching gateway for a rate-limited market-data provider
//!
//! Serves market data to clients with:
//! - Fresh data from an in-memory TTL cache
//! - Stale-while-revalidate background refresh
//! - One upstream call per fingerprint no matter how many clients ask
//! - Rate-limit cool-down so a throttling provider is not hammered
//! - Prometheus metrics

mod cache;
mod config;
mod error;
mod metrics;
mod routes;
mod upstream;

use crate::cache::{load_fallbacks, Gateway};
use crate::config::Config;
use crate::metrics::create_metrics;
use crate::routes::AppState;
use crate::upstream::{HttpUpstream, JsonPayload, Upstream};
use axum::{routing::get, Router};
use clap::Parser;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Quotegate - market-data caching gateway
#[derive(Parser, Debug)]
#[command(name = "quotegate")]
#[command(author, version, about = "Caching gateway for a rate-limited market-data provider", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long)]
    json_logs: bool,

    /// Enable debug logging for upstream requests
    #[arg(long)]
    debug_requests: bool,

    /// Server port (overrides PORT env var)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let boot_start = Instant::now();

    // Load .env file first (before parsing args, so env vars are available)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs, args.debug_requests)?;

    info!("Starting Quotegate v{}", env!("CARGO_PKG_VERSION"));

    // Load config (CLI port overrides env var)
    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.debug_requests = args.debug_requests;

    if config.debug_requests {
        info!("Request debugging enabled");
    }

    let metrics = create_metrics()?;

    let upstream: Arc<dyn Upstream<JsonPayload>> = Arc::new(
        HttpUpstream::new(&config.upstream.base_url, config.upstream.timeout)
            .with_api_key(&config.upstream.api_key_param, config.upstream.api_key.clone()),
    );

    let fallbacks = match &config.cache.fallback_path {
        Some(path) => load_fallbacks(path)?,
        None => {
            info!("No FALLBACK_PATH configured, cold misses fail when the provider does");
            HashMap::new()
        }
    };

    let gateway = Gateway::new(
        &config.to_gateway_config(),
        upstream,
        fallbacks,
        metrics.clone(),
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Periodic gauge updates
    let metrics_updater = {
        let gateway = gateway.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {
                        let metrics = gateway.metrics();
                        metrics.update_cache_metrics(&gateway.stats());
                        metrics.uptime_seconds.set(boot_start.elapsed().as_secs_f64());
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    };

    let state = AppState {
        gateway,
        started_at: chrono::Utc::now(),
    };

    // Setup Router
    let app = Router::new()
        .route("/indices", get(routes::indices_handler))
        .route("/quotes/{symbol}", get(routes::quote_handler))
        .route("/history/{symbol}", get(routes::history_handler))
        .route("/metrics", get(routes::metrics_handler))
        .route("/health", get(routes::health_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(
        boot_ms = boot_start.elapsed().as_millis() as u64,
        "Listening on http://{} (Data: /indices /quotes/{{symbol}} /history/{{symbol}}, Metrics: /metrics, Health: /health)",
        addr
    );

    // In-flight background refreshes are abandoned on shutdown; the next
    // process refetches on first access.
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
        }
        info!("Shutdown signal received, initiating graceful shutdown...");
        let _ = shutdown_tx.send(true);
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    metrics_updater.abort();

    info!("Quotegate shutdown complete");
    Ok(())
}

fn init_logging(level: &str, json: bool, debug_requests: bool) -> anyhow::Result<()> {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);

    // Build filter: set quotegate to requested level, and optionally enable request debugging
    let filter = if debug_requests {
        EnvFilter::new(format!(
            "quotegate={},quotegate::upstream=debug,tower_http=debug,hyper=warn",
            level
        ))
    } else {
        EnvFilter::new(format!("quotegate={},tower_http=info,hyper=warn", level))
    };

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }

    Ok(())
}
