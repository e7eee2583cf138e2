//! Limiter configuration.
//!
//! Defaults: 10 requests per minute for anonymous callers and 30 per minute for callers
//! with a verified credential.

use crate::error::{ConfigError, PolicyError};
use crate::key::PeerAddrResolver;
use crate::policy::{PolicySelector, RateLimitPolicy};
use crate::timeout::StoreTimeout;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_WINDOW_MS: u64 = 60_000;
pub const DEFAULT_BASELINE_CAPACITY: u32 = 10;
pub const DEFAULT_ELEVATED_CAPACITY: u32 = 30;
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 50;
pub const DEFAULT_KEY_PREFIX: &str = "tollgate:";

/// Everything the limiter needs that is not code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Shared counter store endpoint.
    pub store_url: String,
    /// Quota for callers without a verified credential.
    pub baseline: RateLimitPolicy,
    /// Quota for callers whose credential verified.
    pub elevated: RateLimitPolicy,
    /// Upper bound on each store round-trip; expiry fails open.
    pub store_timeout_ms: u64,
    /// Namespace for bucket keys in the shared store.
    pub key_prefix: String,
    /// Evict buckets idle this long. `None` keeps them forever. Must be at least
    /// [`min_idle_ttl_ms`](Self::min_idle_ttl_ms).
    pub idle_ttl_ms: Option<u64>,
    /// Peers whose `X-Forwarded-For` header is honored.
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            store_url: "redis://localhost:6379".to_string(),
            baseline: RateLimitPolicy::BASELINE,
            elevated: RateLimitPolicy::ELEVATED,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            idle_ttl_ms: None,
            trusted_proxies: Vec::new(),
        }
    }
}

impl LimiterConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Meaning |
    /// |----------|---------|
    /// | `REDIS_HOST`, `REDIS_PORT` | store endpoint (`localhost:6379`) |
    /// | `TOLLGATE_BASELINE_CAPACITY` | anonymous requests per window (10) |
    /// | `TOLLGATE_ELEVATED_CAPACITY` | verified requests per window (30) |
    /// | `TOLLGATE_WINDOW_MS` | refill window (60000) |
    /// | `TOLLGATE_STORE_TIMEOUT_MS` | store-call bound (50) |
    /// | `TOLLGATE_KEY_PREFIX` | key namespace (`tollgate:`) |
    /// | `TOLLGATE_IDLE_TTL_MS` | idle eviction (unset) |
    /// | `TOLLGATE_TRUSTED_PROXIES` | comma-separated proxy IPs |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();

        let host = lookup("REDIS_HOST").unwrap_or_else(|| "localhost".to_string());
        let port: u16 = parse_var(&lookup, "REDIS_PORT")?.unwrap_or(6379);
        config.store_url = format!("redis://{}:{}", host, port);

        let window_ms: u64 = parse_var(&lookup, "TOLLGATE_WINDOW_MS")?.unwrap_or(DEFAULT_WINDOW_MS);
        let window = Duration::from_millis(window_ms);
        let baseline: u32 =
            parse_var(&lookup, "TOLLGATE_BASELINE_CAPACITY")?.unwrap_or(DEFAULT_BASELINE_CAPACITY);
        let elevated: u32 =
            parse_var(&lookup, "TOLLGATE_ELEVATED_CAPACITY")?.unwrap_or(DEFAULT_ELEVATED_CAPACITY);
        config.baseline = tier("baseline", RateLimitPolicy::per_window(baseline, window))?;
        config.elevated = tier("elevated", RateLimitPolicy::per_window(elevated, window))?;

        if let Some(ms) = parse_var(&lookup, "TOLLGATE_STORE_TIMEOUT_MS")? {
            config.store_timeout_ms = ms;
        }
        if let Some(prefix) = lookup("TOLLGATE_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        config.idle_ttl_ms = parse_var(&lookup, "TOLLGATE_IDLE_TTL_MS")?;

        if let Some(raw) = lookup("TOLLGATE_TRUSTED_PROXIES") {
            config.trusted_proxies = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse().map_err(|_| ConfigError::InvalidEnv {
                        var: "TOLLGATE_TRUSTED_PROXIES",
                        value: s.to_string(),
                    })
                })
                .collect::<Result<_, _>>()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if let Some(ttl_ms) = self.idle_ttl_ms {
            let min_ms = self.min_idle_ttl_ms();
            if ttl_ms < min_ms {
                return Err(ConfigError::IdleTtlTooShort { ttl_ms, min_ms });
            }
        }
        Ok(())
    }

    /// Shortest idle TTL that cannot change a decision: the slower tier's full refill.
    pub fn min_idle_ttl_ms(&self) -> u64 {
        self.baseline.full_refill_millis().max(self.elevated.full_refill_millis())
    }

    pub fn selector(&self) -> PolicySelector {
        PolicySelector::new(self.baseline, self.elevated)
    }

    pub fn store_timeout(&self) -> Result<StoreTimeout, ConfigError> {
        self.validate()?;
        Ok(StoreTimeout::new(Duration::from_millis(self.store_timeout_ms)))
    }

    pub fn idle_ttl(&self) -> Option<Duration> {
        self.idle_ttl_ms.map(Duration::from_millis)
    }

    pub fn resolver(&self) -> PeerAddrResolver {
        PeerAddrResolver::new().with_trusted_proxies(self.trusted_proxies.iter().copied())
    }
}

fn tier(
    name: &'static str,
    policy: Result<RateLimitPolicy, PolicyError>,
) -> Result<RateLimitPolicy, ConfigError> {
    policy.map_err(|source| ConfigError::InvalidTier { tier: name, source })
}

fn parse_var<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&'static str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
    }
}
