//! Quota tiers and the policy selector.

use crate::error::PolicyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Token-bucket parameters: how many tokens a bucket holds and how fast it refills.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPolicy", into = "RawPolicy")]
pub struct RateLimitPolicy {
    capacity: f64,
    refill_per_milli: f64,
}

impl RateLimitPolicy {
    /// 10 requests per minute.
    pub const BASELINE: Self = Self { capacity: 10.0, refill_per_milli: 10.0 / 60_000.0 };
    /// 30 requests per minute.
    pub const ELEVATED: Self = Self { capacity: 30.0, refill_per_milli: 30.0 / 60_000.0 };

    /// Create a validated policy.
    pub fn new(capacity: f64, refill_per_milli: f64) -> Result<Self, PolicyError> {
        if !capacity.is_finite() || capacity < 1.0 {
            return Err(PolicyError::InvalidCapacity(capacity));
        }
        if !refill_per_milli.is_finite() || refill_per_milli <= 0.0 {
            return Err(PolicyError::InvalidRefillRate(refill_per_milli));
        }
        Ok(Self { capacity, refill_per_milli })
    }

    /// `max_requests` per `window`, refilling continuously over the window.
    pub fn per_window(max_requests: u32, window: Duration) -> Result<Self, PolicyError> {
        let window_ms = window.as_millis();
        if window_ms == 0 {
            return Err(PolicyError::ZeroWindow);
        }
        let capacity = f64::from(max_requests);
        Self::new(capacity, capacity / window_ms as f64)
    }

    /// Maximum tokens a bucket can hold.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens restored per elapsed millisecond.
    pub fn refill_per_milli(&self) -> f64 {
        self.refill_per_milli
    }

    /// Milliseconds needed to accumulate `tokens` from empty.
    pub fn millis_to_refill(&self, tokens: f64) -> f64 {
        tokens.max(0.0) / self.refill_per_milli
    }

    /// Milliseconds for an empty bucket to fill. A bucket idle this long evaluates
    /// exactly like a fresh one.
    pub fn full_refill_millis(&self) -> u64 {
        self.millis_to_refill(self.capacity).ceil() as u64
    }
}

#[derive(Serialize, Deserialize)]
struct RawPolicy {
    capacity: f64,
    refill_per_milli: f64,
}

impl TryFrom<RawPolicy> for RateLimitPolicy {
    type Error = PolicyError;

    fn try_from(raw: RawPolicy) -> Result<Self, Self::Error> {
        Self::new(raw.capacity, raw.refill_per_milli)
    }
}

impl From<RateLimitPolicy> for RawPolicy {
    fn from(p: RateLimitPolicy) -> Self {
        Self { capacity: p.capacity, refill_per_milli: p.refill_per_milli }
    }
}

/// Quota tier a request is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Callers without a verified credential.
    Baseline,
    /// Callers whose credential independently verified.
    Elevated,
}

impl Tier {
    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Baseline => "baseline",
            Tier::Elevated => "elevated",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chooses a tier from a credential-verification result.
///
/// The selector never sees the credential itself; it only consumes the boolean the
/// authentication collaborator produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicySelector {
    baseline: RateLimitPolicy,
    elevated: RateLimitPolicy,
}

impl PolicySelector {
    pub fn new(baseline: RateLimitPolicy, elevated: RateLimitPolicy) -> Self {
        Self { baseline, elevated }
    }

    /// Pure function of `verified`.
    pub fn select(&self, verified: bool) -> (Tier, RateLimitPolicy) {
        if verified {
            (Tier::Elevated, self.elevated)
        } else {
            (Tier::Baseline, self.baseline)
        }
    }

    pub fn policy(&self, tier: Tier) -> RateLimitPolicy {
        match tier {
            Tier::Baseline => self.baseline,
            Tier::Elevated => self.elevated,
        }
    }
}
