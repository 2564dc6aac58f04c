use crate::cache::GatewayConfig;
use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default freshness window: 1 minute in milliseconds
const DEFAULT_CACHE_TTL_MS: u64 = 60 * 1000;
/// Default suppression window after a rate-limit response
const DEFAULT_RATE_LIMIT_COOLDOWN_MS: u64 = 60 * 1000;
const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 10 * 1000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_key_param: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub rate_limit_cooldown: Duration,
    pub max_entries: Option<usize>,
    pub fallback_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    /// Enable debug logging for upstream requests (set via CLI)
    pub debug_requests: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from any key lookup (the process env in production)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = lookup("UPSTREAM_URL").context("UPSTREAM_URL is required")?;
        if base_url.trim().is_empty() {
            bail!("UPSTREAM_URL must not be empty");
        }

        let ttl_ms = parse_or(&lookup, "CACHE_TTL_MS", DEFAULT_CACHE_TTL_MS)?;
        if ttl_ms == 0 {
            bail!("CACHE_TTL_MS must be greater than zero");
        }

        let max_entries = match lookup("CACHE_MAX_ENTRIES") {
            Some(v) => Some(
                v.parse::<usize>()
                    .with_context(|| format!("CACHE_MAX_ENTRIES is not a number: {:?}", v))?,
            ),
            None => None,
        };

        Ok(Self {
            server: ServerConfig {
                port: lookup("PORT")
                    .unwrap_or_else(|| "3000".to_string())
                    .parse()
                    .context("PORT is not a valid port")?,
            },
            upstream: UpstreamConfig {
                base_url,
                api_key: lookup("UPSTREAM_API_KEY").filter(|k| !k.is_empty()),
                api_key_param: lookup("UPSTREAM_API_KEY_PARAM")
                    .unwrap_or_else(|| "apikey".to_string()),
                timeout: Duration::from_millis(parse_or(
                    &lookup,
                    "UPSTREAM_TIMEOUT_MS",
                    DEFAULT_UPSTREAM_TIMEOUT_MS,
                )?),
            },
            cache: CacheConfig {
                ttl: Duration::from_millis(ttl_ms),
                rate_limit_cooldown: Duration::from_millis(parse_or(
                    &lookup,
                    "RATE_LIMIT_COOLDOWN_MS",
                    DEFAULT_RATE_LIMIT_COOLDOWN_MS,
                )?),
                max_entries,
                fallback_path: lookup("FALLBACK_PATH").map(PathBuf::from),
            },
            debug_requests: false, // Set by CLI args in main.rs
        })
    }

    pub fn to_gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            ttl: self.cache.ttl,
            rate_limit_cooldown: self.cache.rate_limit_cooldown,
            max_entries: self.cache.max_entries,
        }
    }
}

fn parse_or<F>(lookup: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(v) => v
            .parse::<u64>()
            .with_context(|| format!("{} is not a number: {:?}", key, v)),
        None => Ok(default),
    }
}
