//! In-memory cache store.
//!
//! Entries are immutable `Arc<CacheEntry>` values; every write swaps the
//! whole `Arc` under the shard lock for that fingerprint, so a concurrent
//! reader sees either the old entry or the new one, never a mix.

use crate::cache::fingerprint::Fingerprint;
use crate::error::{UpstreamError, UpstreamErrorKind};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Most recent upstream failure recorded against an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub kind: UpstreamErrorKind,
    pub at: Instant,
    pub message: String,
    /// Back-off hint from the provider (rate limits only)
    pub retry_after: Option<Duration>,
}

impl LastError {
    pub fn new(error: &UpstreamError, at: Instant) -> Self {
        Self {
            kind: error.kind(),
            at,
            message: error.to_string(),
            retry_after: error.retry_after(),
        }
    }
}

/// A successfully fetched payload plus its freshness bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry<P> {
    pub payload: P,
    pub fetched_at: Instant,
    pub fresh_until: Instant,
    pub last_error: Option<LastError>,
}

impl<P> CacheEntry<P> {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.fresh_until
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.fetched_at)
    }
}

/// Outcome of a `put`, so callers can account for evictions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    pub created: bool,
    pub evicted: usize,
}

#[derive(Clone)]
pub struct CacheStore<P> {
    entries: Arc<DashMap<Fingerprint, Arc<CacheEntry<P>>>>,
    ttl: Duration,
    max_entries: Option<usize>,
}

impl<P> CacheStore<P>
where
    P: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration, max_entries: Option<usize>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
            max_entries: max_entries.filter(|max| *max > 0),
        }
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<CacheEntry<P>>> {
        self.entries.get(fingerprint).map(|e| e.value().clone())
    }

    /// Create or replace the entry; clears any recorded failure
    pub fn put(&self, fingerprint: Fingerprint, payload: P, fetched_at: Instant) -> PutOutcome {
        let entry = Arc::new(CacheEntry {
            payload,
            fetched_at,
            fresh_until: fetched_at + self.ttl,
            last_error: None,
        });

        let evicted = if self.entries.contains_key(&fingerprint) {
            0
        } else {
            self.make_room()
        };

        let created = self.entries.insert(fingerprint, entry).is_none();
        PutOutcome { created, evicted }
    }

    /// Record a failure against an existing entry, leaving payload and
    /// `fetched_at` untouched. Returns false for a cold fingerprint, which
    /// stays cold.
    pub fn record_failure(&self, fingerprint: &Fingerprint, error: &UpstreamError, at: Instant) -> bool {
        match self.entries.get_mut(fingerprint) {
            Some(mut slot) => {
                let mut updated = CacheEntry::clone(slot.value().as_ref());
                updated.last_error = Some(LastError::new(error, at));
                *slot.value_mut() = Arc::new(updated);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries past their freshness window
    pub fn stale_count(&self, now: Instant) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.value().is_fresh(now))
            .count()
    }

    /// Evict least-recently-refreshed entries until one more fits
    fn make_room(&self) -> usize {
        let Some(max) = self.max_entries else {
            return 0;
        };

        let mut evicted = 0;
        while self.entries.len() >= max {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().fetched_at)
                .map(|e| e.key().clone());

            match oldest {
                Some(key) => {
                    if self.entries.remove(&key).is_some() {
                        debug!(fingerprint = %key, "Evicted cache entry (capacity)");
                        evicted += 1;
                    }
                }
                None => break,
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(symbol: &str) -> Fingerprint {
        Fingerprint::with_params("quote", [("symbol", symbol)])
    }

    #[test]
    fn test_put_then_get() {
        let store = CacheStore::new(Duration::from_secs(60), None);
        let now = Instant::now();

        let outcome = store.put(fp("AAPL"), "v1".to_string(), now);
        assert!(outcome.created);

        let entry = store.get(&fp("AAPL")).unwrap();
        assert_eq!(entry.payload, "v1");
        assert_eq!(entry.fetched_at, now);
        assert_eq!(entry.fresh_until, now + Duration::from_secs(60));
        assert!(entry.last_error.is_none());
        assert!(store.get(&fp("MSFT")).is_none());
    }

    #[test]
    fn test_record_failure_keeps_payload() {
        let store = CacheStore::new(Duration::from_secs(60), None);
        let fetched = Instant::now();
        store.put(fp("AAPL"), "v1".to_string(), fetched);

        let later = fetched + Duration::from_secs(5);
        let recorded = store.record_failure(
            &fp("AAPL"),
            &UpstreamError::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
            },
            later,
        );
        assert!(recorded);

        let entry = store.get(&fp("AAPL")).unwrap();
        assert_eq!(entry.payload, "v1");
        assert_eq!(entry.fetched_at, fetched);
        let err = entry.last_error.as_ref().unwrap();
        assert_eq!(err.kind, UpstreamErrorKind::RateLimited);
        assert_eq!(err.at, later);
        assert_eq!(err.retry_after, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_record_failure_on_cold_fingerprint() {
        let store: CacheStore<String> = CacheStore::new(Duration::from_secs(60), None);
        let recorded = store.record_failure(
            &fp("AAPL"),
            &UpstreamError::Unavailable("boom".into()),
            Instant::now(),
        );

        assert!(!recorded);
        assert!(store.get(&fp("AAPL")).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_put_clears_last_error() {
        let store = CacheStore::new(Duration::from_secs(60), None);
        let now = Instant::now();
        store.put(fp("AAPL"), "v1".to_string(), now);
        store.record_failure(&fp("AAPL"), &UpstreamError::Unavailable("down".into()), now);

        let outcome = store.put(fp("AAPL"), "v2".to_string(), now + Duration::from_secs(1));
        assert!(!outcome.created);

        let entry = store.get(&fp("AAPL")).unwrap();
        assert_eq!(entry.payload, "v2");
        assert!(entry.last_error.is_none());
    }

    #[test]
    fn test_reader_keeps_consistent_snapshot() {
        let store = CacheStore::new(Duration::from_secs(60), None);
        let now = Instant::now();
        store.put(fp("AAPL"), "v1".to_string(), now);

        let before = store.get(&fp("AAPL")).unwrap();
        store.put(fp("AAPL"), "v2".to_string(), now + Duration::from_secs(1));

        assert_eq!(before.payload, "v1");
        assert_eq!(before.fetched_at, now);
        assert_eq!(store.get(&fp("AAPL")).unwrap().payload, "v2");
    }

    #[test]
    fn test_capacity_evicts_oldest_refresh() {
        let store = CacheStore::new(Duration::from_secs(60), Some(2));
        let t0 = Instant::now();
        store.put(fp("A"), "a".to_string(), t0);
        store.put(fp("B"), "b".to_string(), t0 + Duration::from_secs(1));

        // Replacing an existing key never evicts
        let outcome = store.put(fp("A"), "a2".to_string(), t0 + Duration::from_secs(2));
        assert_eq!(outcome.evicted, 0);
        assert_eq!(store.len(), 2);

        // B is now the least recently refreshed
        let outcome = store.put(fp("C"), "c".to_string(), t0 + Duration::from_secs(3));
        assert_eq!(outcome.evicted, 1);
        assert_eq!(store.len(), 2);
        assert!(store.get(&fp("B")).is_none());
        assert!(store.get(&fp("A")).is_some());
        assert!(store.get(&fp("C")).is_some());
    }

    #[test]
    fn test_stale_count() {
        let store = CacheStore::new(Duration::from_secs(10), None);
        let t0 = Instant::now();
        store.put(fp("A"), "a".to_string(), t0);
        store.put(fp("B"), "b".to_string(), t0 + Duration::from_secs(8));

        assert_eq!(store.stale_count(t0 + Duration::from_secs(5)), 0);
        assert_eq!(store.stale_count(t0 + Duration::from_secs(12)), 1);
        assert_eq!(store.stale_count(t0 + Duration::from_secs(20)), 2);
    }
}
