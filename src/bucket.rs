//! Bucket state and the token-bucket admission rule.
//!
//! [`evaluate`] is pure: every store implementation funnels through it, whether it runs
//! under a lock, inside a compare-and-set loop, or mirrors it in a server-side script.

use crate::policy::RateLimitPolicy;
use std::time::Duration;

/// Per-client bucket record as persisted in the shared store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Continuous token count, `0 <= tokens <= capacity`.
    pub tokens: f64,
    /// Epoch milliseconds of the last evaluation.
    pub last_refill_millis: u64,
}

impl BucketState {
    /// A full bucket first observed at `now`.
    pub fn fresh(policy: &RateLimitPolicy, now: u64) -> Self {
        Self { tokens: policy.capacity(), last_refill_millis: now }
    }

    /// Restore a stored record, clamping it into the policy's bounds.
    ///
    /// A key can move between tiers, so a record written under the elevated tier may hold
    /// more tokens than the baseline capacity. Non-finite counts are treated as absent.
    pub fn restore(tokens: f64, last_refill_millis: u64, policy: &RateLimitPolicy) -> Option<Self> {
        if !tokens.is_finite() {
            return None;
        }
        Some(Self { tokens: tokens.clamp(0.0, policy.capacity()), last_refill_millis })
    }
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub allowed: bool,
    /// State to persist, allow or deny.
    pub state: BucketState,
}

impl Verdict {
    /// How long until one whole token is available, for `Retry-After`.
    pub fn retry_after(&self, policy: &RateLimitPolicy) -> Duration {
        if self.allowed {
            return Duration::ZERO;
        }
        let missing = 1.0 - self.state.tokens;
        Duration::from_millis(policy.millis_to_refill(missing).ceil() as u64)
    }
}

/// Apply refill and admission to `state` at `now`.
///
/// Elapsed time is clamped at zero and the refill point never moves backwards, so a
/// reading from a lagging clock neither drains tokens nor lets a later reading count the
/// same interval twice.
pub fn evaluate(state: BucketState, policy: &RateLimitPolicy, now: u64) -> Verdict {
    let elapsed = now.saturating_sub(state.last_refill_millis) as f64;
    let refilled = (state.tokens + elapsed * policy.refill_per_milli()).min(policy.capacity());
    let last_refill_millis = state.last_refill_millis.max(now);

    if refilled >= 1.0 {
        Verdict { allowed: true, state: BucketState { tokens: refilled - 1.0, last_refill_millis } }
    } else {
        Verdict { allowed: false, state: BucketState { tokens: refilled, last_refill_millis } }
    }
}
