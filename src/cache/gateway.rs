//! The gateway request handlers call into.
//!
//! Wires the cache store, refresh policy and coalescer together in front of
//! an [`Upstream`]: serve fresh data when we have it, stale data while a
//! refresh runs or the provider is rate limiting us, and only make a caller
//! wait when there is nothing at all to serve.

use crate::cache::coalescer::{Coalescer, FlightRole};
use crate::cache::fingerprint::Fingerprint;
use crate::cache::policy::{RefreshDecision, RefreshPolicy};
use crate::cache::store::{CacheEntry, CacheStore};
use crate::error::{GatewayError, UpstreamError};
use crate::metrics::SharedMetrics;
use crate::upstream::Upstream;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How a resolved payload was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedAs {
    /// Cached and within TTL
    Fresh,
    /// Cached past TTL, or a static fallback
    Stale,
    /// Fetched from upstream for this request
    Cold,
}

impl ServedAs {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServedAs::Fresh => "fresh",
            ServedAs::Stale => "stale",
            ServedAs::Cold => "cold",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolved<P> {
    pub payload: P,
    pub served_as: ServedAs,
    /// Time since the payload was fetched (zero for cold fetches and fallbacks)
    pub age: Duration,
}

/// Tunables for the gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub ttl: Duration,
    pub rate_limit_cooldown: Duration,
    pub max_entries: Option<usize>,
}

/// Point-in-time view used by health checks and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayStats {
    pub entries: usize,
    pub stale_entries: usize,
    pub in_flight: usize,
}

pub struct Gateway<P>
where
    P: Clone + Send + Sync + 'static,
{
    store: CacheStore<P>,
    coalescer: Coalescer<P>,
    policy: RefreshPolicy,
    upstream: Arc<dyn Upstream<P>>,
    fallbacks: Arc<HashMap<Fingerprint, P>>,
    metrics: SharedMetrics,
}

impl<P> Clone for Gateway<P>
where
    P: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            coalescer: self.coalescer.clone(),
            policy: self.policy.clone(),
            upstream: self.upstream.clone(),
            fallbacks: self.fallbacks.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<P> Gateway<P>
where
    P: Clone + Send + Sync + 'static,
{
    pub fn new(
        config: &GatewayConfig,
        upstream: Arc<dyn Upstream<P>>,
        fallbacks: HashMap<Fingerprint, P>,
        metrics: SharedMetrics,
    ) -> Self {
        info!(
            ttl_ms = config.ttl.as_millis() as u64,
            cooldown_ms = config.rate_limit_cooldown.as_millis() as u64,
            max_entries = ?config.max_entries,
            fallbacks = fallbacks.len(),
            "Gateway initialized"
        );

        Self {
            store: CacheStore::new(config.ttl, config.max_entries),
            coalescer: Coalescer::new(),
            policy: RefreshPolicy::new(config.rate_limit_cooldown),
            upstream,
            fallbacks: Arc::new(fallbacks),
            metrics,
        }
    }

    /// Resolve a fingerprint to a payload.
    ///
    /// Fails only when nothing is cached, the upstream fetch fails, and no
    /// fallback is configured for the fingerprint.
    pub async fn resolve(&self, fingerprint: &Fingerprint) -> Result<Resolved<P>, GatewayError> {
        let start = Instant::now();
        let result = self.resolve_inner(fingerprint).await;

        let label = match &result {
            Ok(resolved) => resolved.served_as.as_str(),
            Err(_) => "error",
        };
        self.metrics
            .record_resolve(label, start.elapsed().as_secs_f64());

        result
    }

    async fn resolve_inner(&self, fingerprint: &Fingerprint) -> Result<Resolved<P>, GatewayError> {
        let now = Instant::now();
        let entry = self.store.get(fingerprint);
        let decision = self.policy.classify(
            entry.as_deref(),
            now,
            self.coalescer.is_in_flight(fingerprint),
        );

        match (decision, entry) {
            (RefreshDecision::Fresh, Some(entry)) => {
                let age = entry.age(now);
                debug!(
                    fingerprint = %fingerprint,
                    age_ms = age.as_millis() as u64,
                    "Cache HIT (fresh)"
                );
                Ok(Resolved {
                    payload: entry.payload.clone(),
                    served_as: ServedAs::Fresh,
                    age,
                })
            }
            (RefreshDecision::StaleRefreshable, Some(entry)) => {
                let age = entry.age(now);
                let (_, role) = self
                    .coalescer
                    .fetch_once(fingerprint, || self.refresh_task(fingerprint));
                match role {
                    FlightRole::Leader => {
                        self.metrics.refresh_triggered_total.inc();
                        debug!(
                            fingerprint = %fingerprint,
                            age_ms = age.as_millis() as u64,
                            "Cache HIT (stale), triggered background refresh"
                        );
                    }
                    // Lost the race to another reader between classify and register
                    FlightRole::Follower => self.metrics.record_refresh_suppressed("in_flight"),
                }
                Ok(stale(&entry, age))
            }
            (RefreshDecision::StaleRefreshing, Some(entry)) => {
                let age = entry.age(now);
                self.metrics.record_refresh_suppressed("in_flight");
                debug!(
                    fingerprint = %fingerprint,
                    age_ms = age.as_millis() as u64,
                    "Cache HIT (stale), refresh already in flight"
                );
                Ok(stale(&entry, age))
            }
            (RefreshDecision::StaleBlocked { until }, Some(entry)) => {
                let age = entry.age(now);
                self.metrics.record_refresh_suppressed("cooldown");
                debug!(
                    fingerprint = %fingerprint,
                    age_ms = age.as_millis() as u64,
                    cooldown_remaining_ms = until.saturating_duration_since(now).as_millis() as u64,
                    "Cache HIT (stale), refresh suppressed by rate-limit cool-down"
                );
                Ok(stale(&entry, age))
            }
            (RefreshDecision::Miss, _) | (_, None) => self.resolve_cold(fingerprint).await,
        }
    }

    /// Nothing cached: wait for a (coalesced) fetch, then fall back
    async fn resolve_cold(&self, fingerprint: &Fingerprint) -> Result<Resolved<P>, GatewayError> {
        debug!(fingerprint = %fingerprint, "Cache MISS, fetching from upstream");

        let (pending, role) = self
            .coalescer
            .fetch_once(fingerprint, || self.refresh_task(fingerprint));
        if role == FlightRole::Follower {
            self.metrics.coalesced_waiters_total.inc();
        }

        match pending.await {
            Ok(payload) => Ok(Resolved {
                payload,
                served_as: ServedAs::Cold,
                age: Duration::ZERO,
            }),
            Err(source) => match self.fallbacks.get(fingerprint) {
                Some(fallback) => {
                    self.metrics.fallback_served_total.inc();
                    warn!(
                        fingerprint = %fingerprint,
                        error = %source,
                        "Upstream failed on cold fetch, serving static fallback"
                    );
                    Ok(Resolved {
                        payload: fallback.clone(),
                        served_as: ServedAs::Stale,
                        age: Duration::ZERO,
                    })
                }
                None => Err(GatewayError::NoData {
                    fingerprint: fingerprint.to_string(),
                    source,
                }),
            },
        }
    }

    /// One upstream fetch plus the store update it implies. Runs once per
    /// coalesced flight, however many callers wait on it.
    fn refresh_task(
        &self,
        fingerprint: &Fingerprint,
    ) -> impl Future<Output = Result<P, UpstreamError>> + Send + 'static {
        let upstream = self.upstream.clone();
        let store = self.store.clone();
        let metrics = self.metrics.clone();
        let fingerprint = fingerprint.clone();

        async move {
            let start = Instant::now();
            let result = upstream.fetch(&fingerprint).await;
            let elapsed = start.elapsed();

            match &result {
                Ok(payload) => {
                    metrics.record_upstream("success", elapsed.as_secs_f64());
                    let outcome = store.put(fingerprint.clone(), payload.clone(), Instant::now());
                    if outcome.evicted > 0 {
                        metrics.cache_evictions_total.inc_by(outcome.evicted as f64);
                    }
                    debug!(
                        fingerprint = %fingerprint,
                        id = %fingerprint.id(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        created = outcome.created,
                        "Refreshed"
                    );
                }
                Err(e) => {
                    metrics.record_upstream(e.kind().as_str(), elapsed.as_secs_f64());
                    let had_entry = store.record_failure(&fingerprint, e, Instant::now());
                    warn!(
                        fingerprint = %fingerprint,
                        id = %fingerprint.id(),
                        error = %e,
                        had_entry,
                        "Failed to refresh from upstream"
                    );
                }
            }

            result
        }
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            entries: self.store.len(),
            stale_entries: self.store.stale_count(Instant::now()),
            in_flight: self.coalescer.in_flight_count(),
        }
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }
}

fn stale<P: Clone>(entry: &CacheEntry<P>, age: Duration) -> Resolved<P> {
    Resolved {
        payload: entry.payload.clone(),
        served_as: ServedAs::Stale,
        age,
    }
}
