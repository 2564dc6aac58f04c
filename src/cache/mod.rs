//! Cache module for quotegate.
//!
//! This module provides the caching and resiliency layer in front of the
//! market-data provider:
//! - Fingerprints as cache keys
//! - In-memory store with read-time staleness and optional capacity bound
//! - Refresh policy with rate-limit cool-down
//! - Per-fingerprint request coalescing
//! - The gateway that wires them together

pub mod coalescer;
pub mod fallback;
pub mod fingerprint;
pub mod gateway;
pub mod policy;
pub mod store;

pub use fallback::load_fallbacks;
pub use fingerprint::Fingerprint;
pub use gateway::{Gateway, GatewayConfig, GatewayStats, Resolved, ServedAs};
