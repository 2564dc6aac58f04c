use std::time::Duration;
use thiserror::Error;

/// Failure classification for a single upstream fetch.
///
/// Cloneable because one failure is handed to every caller that joined the
/// same coalesced fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("Upstream rate limited")]
    RateLimited {
        /// Provider-supplied hint for how long to back off, if any
        retry_after: Option<Duration>,
    },

    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed upstream response: {0}")]
    MalformedResponse(String),
}

/// Discriminant of [`UpstreamError`], recorded on cache entries and used as
/// a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamErrorKind {
    RateLimited,
    Unavailable,
    MalformedResponse,
}

impl UpstreamErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamErrorKind::RateLimited => "rate_limited",
            UpstreamErrorKind::Unavailable => "unavailable",
            UpstreamErrorKind::MalformedResponse => "malformed_response",
        }
    }
}

impl UpstreamError {
    pub fn kind(&self) -> UpstreamErrorKind {
        match self {
            UpstreamError::RateLimited { .. } => UpstreamErrorKind::RateLimited,
            UpstreamError::Unavailable(_) => UpstreamErrorKind::Unavailable,
            UpstreamError::MalformedResponse(_) => UpstreamErrorKind::MalformedResponse,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            UpstreamError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            UpstreamError::MalformedResponse(err.to_string())
        } else {
            UpstreamError::Unavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for UpstreamError {
    fn from(err: serde_json::Error) -> Self {
        UpstreamError::MalformedResponse(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Cold fingerprint, upstream failed, and nothing to fall back to
    #[error("No data available for {fingerprint}: {source}")]
    NoData {
        fingerprint: String,
        #[source]
        source: UpstreamError,
    },

    #[error("Fallback error: {0}")]
    Fallback(String),
}

impl GatewayError {
    /// Upstream error kind behind a `NoData` failure
    pub fn upstream_kind(&self) -> Option<UpstreamErrorKind> {
        match self {
            GatewayError::NoData { source, .. } => Some(source.kind()),
            GatewayError::Fallback(_) => None,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Fallback(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Fallback(err.to_string())
    }
}
