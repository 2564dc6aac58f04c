//! Static fallback payloads served on a cold miss when the upstream fails.
//!
//! The file is a JSON object keyed by canonical fingerprint:
//!
//! ```json
//! { "indices": [...], "quote?symbol=SPY": {...} }
//! ```

use crate::cache::fingerprint::Fingerprint;
use crate::error::GatewayError;
use crate::upstream::JsonPayload;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub fn load_fallbacks(path: &Path) -> Result<HashMap<Fingerprint, JsonPayload>, GatewayError> {
    let content = std::fs::read_to_string(path)?;
    let raw: Map<String, Value> = serde_json::from_str(&content)?;

    let mut fallbacks = HashMap::with_capacity(raw.len());
    for (key, payload) in raw {
        let fingerprint: Fingerprint = key
            .parse()
            .map_err(|e| GatewayError::Fallback(format!("{}: {}", path.display(), e)))?;
        if payload.is_null() {
            return Err(GatewayError::Fallback(format!(
                "{}: null payload for {}",
                path.display(),
                fingerprint
            )));
        }
        fallbacks.insert(fingerprint, Arc::new(payload));
    }

    info!(
        fallbacks = fallbacks.len(),
        path = %path.display(),
        "Loaded static fallback payloads"
    );
    Ok(fallbacks)
}
