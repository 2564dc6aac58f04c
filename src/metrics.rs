//! Prometheus metrics for monitoring quotegate.
//!
//! Covers how requests were served, upstream traffic and its outcomes, and
//! the coalescing and cool-down machinery that keeps that traffic down.

use prometheus::{
    Counter, CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::sync::Arc;
use tracing::error;

/// All metrics for the quotegate service
pub struct Metrics {
    pub registry: Registry,

    // Resolve metrics
    pub resolve_total: CounterVec,
    pub resolve_duration_seconds: HistogramVec,
    pub fallback_served_total: Counter,

    // Refresh metrics
    pub refresh_triggered_total: Counter,
    pub refresh_suppressed_total: CounterVec,
    pub coalesced_waiters_total: Counter,

    // Upstream metrics
    pub upstream_requests_total: CounterVec,
    pub upstream_request_duration_seconds: Histogram,

    // Cache metrics
    pub cache_entries: Gauge,
    pub cache_stale_entries: Gauge,
    pub cache_evictions_total: Counter,
    pub inflight_fetches: Gauge,

    // System metrics
    pub uptime_seconds: Gauge,
}

impl Metrics {
    /// Create a new metrics registry with all metrics
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let resolve_total = CounterVec::new(
            Opts::new("quotegate_resolve_total", "Resolved requests by how they were served"),
            &["served_as"],
        )?;
        registry.register(Box::new(resolve_total.clone()))?;

        let resolve_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "quotegate_resolve_duration_seconds",
                "Time to resolve a request",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0,
            ]),
            &["served_as"],
        )?;
        registry.register(Box::new(resolve_duration_seconds.clone()))?;

        let fallback_served_total = Counter::with_opts(Opts::new(
            "quotegate_fallback_served_total",
            "Cold misses answered with a static fallback payload",
        ))?;
        registry.register(Box::new(fallback_served_total.clone()))?;

        let refresh_triggered_total = Counter::with_opts(Opts::new(
            "quotegate_refresh_triggered_total",
            "Background refreshes started for stale entries",
        ))?;
        registry.register(Box::new(refresh_triggered_total.clone()))?;

        let refresh_suppressed_total = CounterVec::new(
            Opts::new(
                "quotegate_refresh_suppressed_total",
                "Stale reads that did not start a refresh",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(refresh_suppressed_total.clone()))?;

        let coalesced_waiters_total = Counter::with_opts(Opts::new(
            "quotegate_coalesced_waiters_total",
            "Callers that joined an already in-flight fetch",
        ))?;
        registry.register(Box::new(coalesced_waiters_total.clone()))?;

        let upstream_requests_total = CounterVec::new(
            Opts::new("quotegate_upstream_requests_total", "Upstream fetches by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(upstream_requests_total.clone()))?;

        let upstream_request_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "quotegate_upstream_request_duration_seconds",
                "Upstream fetch duration",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        registry.register(Box::new(upstream_request_duration_seconds.clone()))?;

        let cache_entries = Gauge::with_opts(Opts::new(
            "quotegate_cache_entries",
            "Entries held in the cache store",
        ))?;
        registry.register(Box::new(cache_entries.clone()))?;

        let cache_stale_entries = Gauge::with_opts(Opts::new(
            "quotegate_cache_stale_entries",
            "Entries past their freshness window",
        ))?;
        registry.register(Box::new(cache_stale_entries.clone()))?;

        let cache_evictions_total = Counter::with_opts(Opts::new(
            "quotegate_cache_evictions_total",
            "Entries evicted by the capacity policy",
        ))?;
        registry.register(Box::new(cache_evictions_total.clone()))?;

        let inflight_fetches = Gauge::with_opts(Opts::new(
            "quotegate_inflight_fetches",
            "Upstream fetches currently in flight",
        ))?;
        registry.register(Box::new(inflight_fetches.clone()))?;

        let uptime_seconds = Gauge::with_opts(Opts::new(
            "quotegate_uptime_seconds",
            "Time since process start",
        ))?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            registry,
            resolve_total,
            resolve_duration_seconds,
            fallback_served_total,
            refresh_triggered_total,
            refresh_suppressed_total,
            coalesced_waiters_total,
            upstream_requests_total,
            upstream_request_duration_seconds,
            cache_entries,
            cache_stale_entries,
            cache_evictions_total,
            inflight_fetches,
            uptime_seconds,
        })
    }

    /// Record a resolved request
    pub fn record_resolve(&self, served_as: &str, duration_secs: f64) {
        self.resolve_total.with_label_values(&[served_as]).inc();
        self.resolve_duration_seconds
            .with_label_values(&[served_as])
            .observe(duration_secs);
    }

    /// Record an upstream fetch completion
    pub fn record_upstream(&self, outcome: &str, duration_secs: f64) {
        self.upstream_requests_total
            .with_label_values(&[outcome])
            .inc();
        self.upstream_request_duration_seconds.observe(duration_secs);
    }

    pub fn record_refresh_suppressed(&self, reason: &str) {
        self.refresh_suppressed_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Update cache gauges
    pub fn update_cache_metrics(&self, stats: &crate::cache::GatewayStats) {
        self.cache_entries.set(stats.entries as f64);
        self.cache_stale_entries.set(stats.stale_entries as f64);
        self.inflight_fetches.set(stats.in_flight as f64);
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                String::new()
            }
        }
    }
}

/// Shared metrics instance
pub type SharedMetrics = Arc<Metrics>;

/// Create a shared metrics instance
pub fn create_metrics() -> anyhow::Result<SharedMetrics> {
    Ok(Arc::new(Metrics::new()?))
}
