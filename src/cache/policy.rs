//! Refresh policy: decides per request whether to serve, refresh or block.

use crate::cache::store::CacheEntry;
use crate::error::UpstreamErrorKind;
use std::time::Duration;
use tokio::time::Instant;

/// Upper bound on a rate-limit cool-down, whatever the config or the
/// provider's `Retry-After` asks for
pub const MAX_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

/// What the gateway should do with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshDecision {
    /// Nothing cached; the caller must wait for a fetch
    Miss,
    /// Serve the cached payload, no upstream call
    Fresh,
    /// Serve stale payload and start a background refresh
    StaleRefreshable,
    /// Serve stale payload; a refresh is already in flight
    StaleRefreshing,
    /// Serve stale payload; provider is rate limiting us until `until`
    StaleBlocked { until: Instant },
}

#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    rate_limit_cooldown: Duration,
}

impl RefreshPolicy {
    pub fn new(rate_limit_cooldown: Duration) -> Self {
        Self {
            rate_limit_cooldown,
        }
    }

    pub fn classify<P>(
        &self,
        entry: Option<&CacheEntry<P>>,
        now: Instant,
        refresh_in_flight: bool,
    ) -> RefreshDecision {
        let Some(entry) = entry else {
            return RefreshDecision::Miss;
        };

        if entry.is_fresh(now) {
            return RefreshDecision::Fresh;
        }

        if let Some(until) = self.blocked_until(entry, now) {
            return RefreshDecision::StaleBlocked { until };
        }

        if refresh_in_flight {
            RefreshDecision::StaleRefreshing
        } else {
            RefreshDecision::StaleRefreshable
        }
    }

    /// End of the suppression window after a rate-limit failure, if `now`
    /// is still inside it. The provider's own hint wins when it asks for
    /// longer than configured.
    fn blocked_until<P>(&self, entry: &CacheEntry<P>, now: Instant) -> Option<Instant> {
        let err = entry.last_error.as_ref()?;
        if err.kind != UpstreamErrorKind::RateLimited {
            return None;
        }

        let window = err
            .retry_after
            .map_or(self.rate_limit_cooldown, |hint| hint.max(self.rate_limit_cooldown))
            .min(MAX_COOLDOWN);

        match err.at.checked_add(window) {
            Some(until) => (now < until).then_some(until),
            // Window end is past what Instant can hold, so it has not passed
            None => Some(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::LastError;
    use crate::error::UpstreamError;

    const TTL: Duration = Duration::from_secs(60);
    const COOLDOWN: Duration = Duration::from_secs(30);

    fn entry(fetched_at: Instant, last_error: Option<LastError>) -> CacheEntry<&'static str> {
        CacheEntry {
            payload: "payload",
            fetched_at,
            fresh_until: fetched_at + TTL,
            last_error,
        }
    }

    #[test]
    fn test_miss_without_entry() {
        let policy = RefreshPolicy::new(COOLDOWN);
        let decision = policy.classify::<&str>(None, Instant::now(), false);
        assert_eq!(decision, RefreshDecision::Miss);
    }

    #[test]
    fn test_fresh_until_ttl() {
        let policy = RefreshPolicy::new(COOLDOWN);
        let t0 = Instant::now();
        let e = entry(t0, None);

        assert_eq!(policy.classify(Some(&e), t0, false), RefreshDecision::Fresh);
        assert_eq!(
            policy.classify(Some(&e), t0 + TTL - Duration::from_millis(1), true),
            RefreshDecision::Fresh
        );
        assert_eq!(
            policy.classify(Some(&e), t0 + TTL, false),
            RefreshDecision::StaleRefreshable
        );
    }

    #[test]
    fn test_stale_with_refresh_in_flight() {
        let policy = RefreshPolicy::new(COOLDOWN);
        let t0 = Instant::now();
        let e = entry(t0, None);

        assert_eq!(
            policy.classify(Some(&e), t0 + TTL * 2, true),
            RefreshDecision::StaleRefreshing
        );
    }

    #[test]
    fn test_rate_limit_blocks_until_cooldown_elapses() {
        let policy = RefreshPolicy::new(COOLDOWN);
        let t0 = Instant::now();
        let failed_at = t0 + TTL + Duration::from_secs(1);
        let err = LastError::new(&UpstreamError::RateLimited { retry_after: None }, failed_at);
        let e = entry(t0, Some(err));

        assert_eq!(
            policy.classify(Some(&e), failed_at + Duration::from_secs(10), false),
            RefreshDecision::StaleBlocked {
                until: failed_at + COOLDOWN
            }
        );
        // Blocked wins over an in-flight refresh
        assert!(matches!(
            policy.classify(Some(&e), failed_at, true),
            RefreshDecision::StaleBlocked { .. }
        ));
        assert_eq!(
            policy.classify(Some(&e), failed_at + COOLDOWN, false),
            RefreshDecision::StaleRefreshable
        );
    }

    #[test]
    fn test_retry_after_extends_cooldown() {
        let policy = RefreshPolicy::new(COOLDOWN);
        let t0 = Instant::now();
        let failed_at = t0 + TTL;
        let err = LastError::new(
            &UpstreamError::RateLimited {
                retry_after: Some(Duration::from_secs(120)),
            },
            failed_at,
        );
        let e = entry(t0, Some(err));

        assert!(matches!(
            policy.classify(Some(&e), failed_at + Duration::from_secs(90), false),
            RefreshDecision::StaleBlocked { .. }
        ));
        assert_eq!(
            policy.classify(Some(&e), failed_at + Duration::from_secs(120), false),
            RefreshDecision::StaleRefreshable
        );
    }

    #[test]
    fn test_short_retry_after_does_not_shorten_cooldown() {
        let policy = RefreshPolicy::new(COOLDOWN);
        let t0 = Instant::now();
        let failed_at = t0 + TTL;
        let err = LastError::new(
            &UpstreamError::RateLimited {
                retry_after: Some(Duration::from_secs(1)),
            },
            failed_at,
        );
        let e = entry(t0, Some(err));

        assert!(matches!(
            policy.classify(Some(&e), failed_at + Duration::from_secs(5), false),
            RefreshDecision::StaleBlocked { .. }
        ));
    }

    #[test]
    fn test_huge_retry_after_is_capped() {
        let policy = RefreshPolicy::new(COOLDOWN);
        let t0 = Instant::now();
        let failed_at = t0 + TTL + Duration::from_secs(1);
        let err = LastError::new(
            &UpstreamError::RateLimited {
                retry_after: "18446744073709551615".parse().ok().map(Duration::from_secs),
            },
            failed_at,
        );
        let e = entry(t0, Some(err));

        assert_eq!(
            policy.classify(Some(&e), t0 + Duration::from_secs(62), false),
            RefreshDecision::StaleBlocked {
                until: failed_at + MAX_COOLDOWN
            }
        );
        assert_eq!(
            policy.classify(Some(&e), failed_at + MAX_COOLDOWN, false),
            RefreshDecision::StaleRefreshable
        );
    }

    #[test]
    fn test_huge_configured_cooldown_is_capped() {
        let policy = RefreshPolicy::new(Duration::MAX);
        let t0 = Instant::now();
        let err = LastError::new(&UpstreamError::RateLimited { retry_after: None }, t0);
        let e = entry(t0, Some(err));

        assert!(matches!(
            policy.classify(Some(&e), t0 + TTL, false),
            RefreshDecision::StaleBlocked { .. }
        ));
        assert_eq!(
            policy.classify(Some(&e), t0 + MAX_COOLDOWN, false),
            RefreshDecision::StaleRefreshable
        );
    }

    #[test]
    fn test_other_failures_never_block() {
        let policy = RefreshPolicy::new(COOLDOWN);
        let t0 = Instant::now();
        let failed_at = t0 + TTL;

        for error in [
            UpstreamError::Unavailable("503".into()),
            UpstreamError::MalformedResponse("not json".into()),
        ] {
            let e = entry(t0, Some(LastError::new(&error, failed_at)));
            assert_eq!(
                policy.classify(Some(&e), failed_at + Duration::from_secs(1), false),
                RefreshDecision::StaleRefreshable
            );
        }
    }
}
