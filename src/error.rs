//! Error types for the admission pipeline
use std::time::Duration;
use thiserror::Error;

/// Failures raised by a [`BucketStore`](crate::store::BucketStore).
///
/// The limiter fails open on every variant except [`StoreError::Contention`]:
/// an outage in the shared store must not become an outage of the protected service,
/// but losing an optimistic-locking race is not an outage.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// The store call exceeded its latency bound.
    #[error("store call timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    /// The store could not be reached or rejected the command.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A stored record could not be decoded.
    #[error("malformed bucket record for `{key}`: {reason}")]
    Malformed { key: String, reason: String },
    /// Every compare-and-set attempt lost a race with another writer.
    #[error("gave up on `{key}` after {attempts} contended attempts")]
    Contention { key: String, attempts: usize },
}

impl StoreError {
    /// Whether this failure should degrade to fail-open admission.
    ///
    /// Every variant except [`Contention`](Self::Contention) fails open. Contention is a
    /// deliberate exception to fail-open: the store answered, but the caller kept losing
    /// the compare-and-set race, and admitting it could push a bucket past capacity. The
    /// limiter denies it with a short retry hint instead.
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, Self::Contention { .. })
    }

    /// The store call outlived its [`StoreTimeout`](crate::StoreTimeout).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors produced when validating a rate-limit policy.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PolicyError {
    /// Capacity must be finite and at least one token, or nothing could ever be admitted.
    #[error("capacity must be finite and >= 1 (got {0})")]
    InvalidCapacity(f64),
    /// Refill rate must be finite and positive.
    #[error("refill rate must be finite and > 0 (got {0})")]
    InvalidRefillRate(f64),
    /// A window-based policy needs a non-zero window.
    #[error("window must be non-zero")]
    ZeroWindow,
}

/// Errors produced while building limiter configuration.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    /// An environment variable held an unparsable value.
    #[error("invalid value `{value}` for {var}")]
    InvalidEnv { var: &'static str, value: String },
    /// A tier failed policy validation.
    #[error("invalid {tier} tier: {source}")]
    InvalidTier {
        tier: &'static str,
        #[source]
        source: PolicyError,
    },
    /// The store-call timeout must be non-zero.
    #[error("store timeout must be non-zero")]
    ZeroTimeout,
    /// Evicting sooner than a full refill would hand idle callers a fresh bucket early.
    #[error("idle TTL of {ttl_ms}ms is shorter than a full refill ({min_ms}ms)")]
    IdleTtlTooShort { ttl_ms: u64, min_ms: u64 },
}
