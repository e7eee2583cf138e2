//! Admission orchestration.
//!
//! Each request walks `SELECT_POLICY -> EVALUATE -> {Allowed, Denied, Degraded}`; key
//! resolution happens in the middleware before the limiter is reached.
//!
//! - A store failure of any kind except lost CAS races degrades to admission. No state
//!   is mutated, and a [`AdmissionEvent::Degraded`] event plus a counter record it.
//! - A CAS loop that exhausts its retry budget denies: admitting would risk exceeding
//!   the bucket's capacity.

use crate::bucket::BucketState;
use crate::clock::{Clock, SystemClock};
use crate::config::LimiterConfig;
use crate::error::{ConfigError, StoreError};
use crate::key::ClientKey;
use crate::policy::{PolicySelector, Tier};
use crate::store::BucketStore;
use crate::telemetry::{emit_best_effort, AdmissionEvent, LogSink, TelemetrySink};
use crate::timeout::StoreTimeout;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Retry hint for requests denied because of write contention.
pub const CONTENTION_RETRY_AFTER: Duration = Duration::from_millis(100);

/// Decision for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// A token was consumed.
    Allowed { tier: Tier, remaining: f64 },
    /// No token was available.
    Denied { tier: Tier, retry_after: Duration },
    /// The store failed; the request proceeds and nothing was persisted.
    Degraded { tier: Tier, error: StoreError },
}

impl Admission {
    /// Whether the request should reach the downstream handler.
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Denied { .. })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Admission::Degraded { .. })
    }

    pub fn tier(&self) -> Tier {
        match self {
            Admission::Allowed { tier, .. }
            | Admission::Denied { tier, .. }
            | Admission::Degraded { tier, .. } => *tier,
        }
    }
}

/// Running decision counters.
#[derive(Debug, Default)]
pub struct LimiterStats {
    allowed: AtomicU64,
    denied: AtomicU64,
    degraded: AtomicU64,
}

/// Point-in-time copy of [`LimiterStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub allowed: u64,
    pub denied: u64,
    /// Requests admitted while the store was unavailable.
    pub degraded: u64,
}

impl LimiterStats {
    fn record(&self, admission: &Admission) {
        let counter = match admission {
            Admission::Allowed { .. } => &self.allowed,
            Admission::Denied { .. } => &self.denied,
            Admission::Degraded { .. } => &self.degraded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }
}

/// Distributed token-bucket limiter.
///
/// Holds no bucket state of its own: every check is a full round-trip through the
/// injected [`BucketStore`], the only component visible to every service instance.
pub struct Limiter<T = LogSink> {
    store: Arc<dyn BucketStore>,
    selector: PolicySelector,
    clock: Arc<dyn Clock>,
    timeout: StoreTimeout,
    sink: T,
    stats: Arc<LimiterStats>,
}

impl<T> fmt::Debug for Limiter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("selector", &self.selector)
            .field("clock", &self.clock)
            .field("timeout", &self.timeout)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl Limiter<LogSink> {
    /// Limiter with the wall clock, a 50ms store timeout, and log telemetry.
    pub fn new<S>(store: S, selector: PolicySelector) -> Self
    where
        S: BucketStore + 'static,
    {
        Self {
            store: Arc::new(store),
            selector,
            clock: Arc::new(SystemClock),
            timeout: StoreTimeout::new(Duration::from_millis(
                crate::config::DEFAULT_STORE_TIMEOUT_MS,
            )),
            sink: LogSink,
            stats: Arc::new(LimiterStats::default()),
        }
    }

    /// Limiter with tiers and store timeout taken from `config`.
    pub fn from_config<S>(store: S, config: &LimiterConfig) -> Result<Self, ConfigError>
    where
        S: BucketStore + 'static,
    {
        let timeout = config.store_timeout()?;
        Ok(Self::new(store, config.selector()).with_timeout(timeout))
    }
}

impl<T> Limiter<T> {
    /// Override the time source.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override the store-call latency bound.
    pub fn with_timeout(mut self, timeout: StoreTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Route admission events to `sink`.
    pub fn with_sink<U>(self, sink: U) -> Limiter<U> {
        Limiter {
            store: self.store,
            selector: self.selector,
            clock: self.clock,
            timeout: self.timeout,
            sink,
            stats: self.stats,
        }
    }

    pub fn selector(&self) -> &PolicySelector {
        &self.selector
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl<T> Limiter<T>
where
    T: TelemetrySink + Sync,
    T::Future: Send + 'static,
{
    /// Decide whether the caller identified by `key` may proceed.
    ///
    /// `verified` is the authentication collaborator's verdict on the caller's
    /// credential; it only selects the tier.
    pub async fn check(&self, key: &ClientKey, verified: bool) -> Admission {
        let (tier, policy) = self.selector.select(verified);
        let now = self.clock.now_millis();

        let result = self.timeout.execute(self.store.apply_and_persist(key, &policy, now)).await;

        let admission = match result {
            Ok(verdict) if verdict.allowed => {
                Admission::Allowed { tier, remaining: verdict.state.tokens }
            }
            Ok(verdict) => Admission::Denied { tier, retry_after: verdict.retry_after(&policy) },
            Err(error) if error.is_unavailable() => Admission::Degraded { tier, error },
            // Contention: not an outage, so no fail-open.
            Err(error) => {
                tracing::warn!(client = %key, tier = %tier, error = %error, "denying contended request");
                Admission::Denied { tier, retry_after: CONTENTION_RETRY_AFTER }
            }
        };

        self.stats.record(&admission);
        emit_best_effort(self.sink.clone(), event_for(key, &admission)).await;
        admission
    }

    /// Current bucket for `key` under the tier `verified` selects, without consuming a token.
    pub async fn peek(&self, key: &ClientKey, verified: bool) -> Result<BucketState, StoreError> {
        let (_, policy) = self.selector.select(verified);
        let now = self.clock.now_millis();
        self.timeout.execute(self.store.load(key, &policy, now)).await
    }
}

fn event_for(key: &ClientKey, admission: &Admission) -> AdmissionEvent {
    let client = key.clone();
    match admission {
        Admission::Allowed { tier, remaining } => {
            AdmissionEvent::Allowed { client, tier: *tier, remaining: *remaining }
        }
        Admission::Denied { tier, retry_after } => {
            AdmissionEvent::Denied { client, tier: *tier, retry_after: *retry_after }
        }
        Admission::Degraded { tier, error } => {
            AdmissionEvent::Degraded { client, tier: *tier, reason: error.to_string() }
        }
    }
}
