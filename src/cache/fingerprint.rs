//! Cache keys derived from a logical request.
//!
//! A fingerprint is an endpoint name plus its identifying parameters. The
//! parameters are kept sorted so that two requests differing only in
//! parameter order map to the same cache entry.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Immutable, cheaply cloneable cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint {
    /// Canonical `endpoint?k=v&k=v` form; equality and hashing go through it
    canonical: Arc<str>,
    endpoint: Arc<str>,
    params: Arc<BTreeMap<String, String>>,
}

impl Fingerprint {
    /// Fingerprint for an endpoint without parameters
    pub fn new(endpoint: &str) -> Self {
        Self::with_params(endpoint, BTreeMap::<String, String>::new())
    }

    /// Fingerprint for an endpoint with parameters (order-independent)
    pub fn with_params<I, K, V>(endpoint: &str, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let params: BTreeMap<String, String> = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let mut canonical = urlencoding::encode(endpoint).into_owned();
        for (i, (k, v)) in params.iter().enumerate() {
            canonical.push(if i == 0 { '?' } else { '&' });
            canonical.push_str(&urlencoding::encode(k));
            canonical.push('=');
            canonical.push_str(&urlencoding::encode(v));
        }

        Self {
            canonical: canonical.into(),
            endpoint: endpoint.into(),
            params: Arc::new(params),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Short stable id (first 16 hex chars of the SHA-256 of the canonical form)
    pub fn id(&self) -> String {
        let digest = Sha256::digest(self.canonical.as_bytes());
        hex::encode(&digest[..8])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    /// Parse the canonical `endpoint?k=v&k=v` form
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (endpoint, query) = match s.split_once('?') {
            Some((e, q)) => (e, Some(q)),
            None => (s, None),
        };

        let endpoint = urlencoding::decode(endpoint)
            .map_err(|e| format!("invalid endpoint encoding in {:?}: {}", s, e))?;
        if endpoint.is_empty() {
            return Err(format!("empty endpoint in {:?}", s));
        }

        let mut params = Vec::new();
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            for pair in query.split('&') {
                let (k, v) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("parameter without value in {:?}", s))?;
                let k = urlencoding::decode(k)
                    .map_err(|e| format!("invalid parameter encoding in {:?}: {}", s, e))?;
                let v = urlencoding::decode(v)
                    .map_err(|e| format!("invalid parameter encoding in {:?}: {}", s, e))?;
                params.push((k.into_owned(), v.into_owned()));
            }
        }

        Ok(Self::with_params(&endpoint, params))
    }
}
