//! Upstream request coalescing.
//!
//! Maps each fingerprint with a fetch in progress to a shared pending
//! result. Late arrivals attach to that result instead of issuing their own
//! call, so N concurrent requests for one fingerprint cost one upstream call.

use crate::cache::fingerprint::Fingerprint;
use crate::error::UpstreamError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Result handle shared by every caller of one coalesced fetch
pub type PendingFetch<P> = Shared<BoxFuture<'static, Result<P, UpstreamError>>>;

/// Whether a caller started the fetch or joined one already running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    Leader,
    Follower,
}

#[derive(Clone)]
pub struct Coalescer<P>
where
    P: Clone + Send + Sync + 'static,
{
    inflight: Arc<DashMap<Fingerprint, PendingFetch<P>>>,
}

impl<P> Coalescer<P>
where
    P: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Join the in-flight fetch for `fingerprint`, or start one with `fetch`.
    ///
    /// Registration happens before this returns, and a started fetch is
    /// driven by its own task: dropping the returned handle does not cancel
    /// it. The in-flight marker is removed as soon as the fetch finishes,
    /// and also if it panics or is dropped; a panic reaches waiters as
    /// [`UpstreamError::Unavailable`].
    pub fn fetch_once<F, Fut>(&self, fingerprint: &Fingerprint, fetch: F) -> (PendingFetch<P>, FlightRole)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<P, UpstreamError>> + Send + 'static,
    {
        let pending = match self.inflight.entry(fingerprint.clone()) {
            Entry::Occupied(slot) => {
                trace!(fingerprint = %fingerprint, "Joining in-flight fetch");
                return (slot.get().clone(), FlightRole::Follower);
            }
            Entry::Vacant(slot) => {
                let inflight = self.inflight.clone();
                let key = fingerprint.clone();
                let fut = fetch();

                let pending = async move {
                    let _marker = InflightMarker {
                        inflight,
                        key: key.clone(),
                    };
                    let result = match AssertUnwindSafe(fut).catch_unwind().await {
                        Ok(result) => result,
                        Err(_) => {
                            error!(fingerprint = %key, "Upstream fetch panicked");
                            Err(UpstreamError::Unavailable("fetch panicked".into()))
                        }
                    };
                    debug!(fingerprint = %key, ok = result.is_ok(), "Fetch completed");
                    result
                }
                .boxed()
                .shared();

                slot.insert(pending.clone());
                pending
            }
        };

        // Spawn after the shard lock is released; the driver removes the marker
        tokio::spawn(pending.clone().map(|_| ()));

        (pending, FlightRole::Leader)
    }

    pub fn is_in_flight(&self, fingerprint: &Fingerprint) -> bool {
        self.inflight.contains_key(fingerprint)
    }

    pub fn in_flight_count(&self) -> usize {
        self.inflight.len()
    }
}

/// Clears the in-flight marker when the fetch future finishes or unwinds
struct InflightMarker<P>
where
    P: Clone + Send + Sync + 'static,
{
    inflight: Arc<DashMap<Fingerprint, PendingFetch<P>>>,
    key: Fingerprint,
}

impl<P> Drop for InflightMarker<P>
where
    P: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inflight.remove(&self.key);
    }
}

impl<P> Default for Coalescer<P>
where
    P: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
