//! Upstream market-data provider access.

pub mod http;

use crate::cache::fingerprint::Fingerprint;
use crate::error::UpstreamError;
use futures::future::BoxFuture;

pub use http::{HttpUpstream, JsonPayload};

/// A single logical fetch against the provider.
///
/// Implementations classify failures into [`UpstreamError`] and must not
/// retry: back-off is the refresh policy's job.
pub trait Upstream<P>: Send + Sync {
    fn fetch(&self, fingerprint: &Fingerprint) -> BoxFuture<'static, Result<P, UpstreamError>>;
}
