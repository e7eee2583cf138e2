//! Latency bound for store round-trips

use crate::error::StoreError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Store calls slower than this count as an outage and fail open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreTimeout {
    limit: Duration,
}

impl StoreTimeout {
    /// Bound store calls by `limit`.
    ///
    /// # Panics
    /// If `limit` is zero: every call would time out and the limiter would never consult
    /// the store.
    pub fn new(limit: Duration) -> Self {
        assert!(!limit.is_zero(), "store timeout must be non-zero");
        Self { limit }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    /// Await `call`, or give up with [`StoreError::Timeout`] once the limit passes.
    ///
    /// On expiry the call's future is dropped. Store implementations keep each update a
    /// single atomic unit, so dropping cannot leave a half-written record.
    pub async fn execute<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let started = Instant::now();
        tokio::time::timeout(self.limit, call).await.unwrap_or_else(|_| {
            Err(StoreError::Timeout { elapsed: started.elapsed(), timeout: self.limit })
        })
    }
}
