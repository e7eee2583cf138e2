use crate::bucket::{evaluate, BucketState, Verdict};
use crate::error::StoreError;
use crate::key::ClientKey;
use crate::policy::RateLimitPolicy;
use crate::store::BucketStore;
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Attempts before a contended update gives up.
pub const DEFAULT_MAX_ATTEMPTS: usize = 64;

/// A bucket record together with the version it was read at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VersionedRecord {
    /// Raw stored state; may be out of bounds for the current policy.
    pub state: BucketState,
    /// Bumped on every successful write.
    ///
    /// A counter rather than the refill timestamp: two writers in the same millisecond
    /// produce the same timestamp but never the same version.
    pub version: u64,
}

/// Versioned key-value backend with a conditional write.
///
/// This is all a shared store needs to offer for [`CasBucketStore`] to build linearizable
/// bucket updates on top of it.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch the current record and its version.
    async fn get(&self, key: &str) -> Result<Option<VersionedRecord>, StoreError>;

    /// Write `state` only if the stored version still equals `expected`.
    ///
    /// `expected == None` means the key must still be absent. Returns `Ok(false)` when
    /// another writer got there first.
    async fn compare_and_set(
        &self,
        key: &str,
        state: BucketState,
        expected: Option<u64>,
    ) -> Result<bool, StoreError>;
}

/// Bucket store built from an optimistic-locking retry loop.
#[derive(Debug, Clone)]
pub struct CasBucketStore<R> {
    records: R,
    max_attempts: usize,
}

impl<R> CasBucketStore<R>
where
    R: RecordStore,
{
    pub fn new(records: R) -> Self {
        Self { records, max_attempts: DEFAULT_MAX_ATTEMPTS }
    }

    /// Cap the optimistic-locking loop. Panics if zero.
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        assert!(attempts > 0, "max_attempts must be > 0");
        self.max_attempts = attempts;
        self
    }

    /// Borrow the underlying record store.
    pub fn records(&self) -> &R {
        &self.records
    }

    async fn read(
        &self,
        key: &ClientKey,
        policy: &RateLimitPolicy,
        now: u64,
    ) -> Result<(BucketState, Option<u64>), StoreError> {
        Ok(match self.records.get(key.as_str()).await? {
            Some(rec) => {
                let state = BucketState::restore(rec.state.tokens, rec.state.last_refill_millis, policy)
                    .unwrap_or_else(|| BucketState::fresh(policy, now));
                (state, Some(rec.version))
            }
            None => (BucketState::fresh(policy, now), None),
        })
    }
}

#[async_trait]
impl<R> BucketStore for CasBucketStore<R>
where
    R: RecordStore,
{
    async fn load(
        &self,
        key: &ClientKey,
        policy: &RateLimitPolicy,
        now: u64,
    ) -> Result<BucketState, StoreError> {
        Ok(self.read(key, policy, now).await?.0)
    }

    async fn apply_and_persist(
        &self,
        key: &ClientKey,
        policy: &RateLimitPolicy,
        now: u64,
    ) -> Result<Verdict, StoreError> {
        for attempt in 1..=self.max_attempts {
            let (state, version) = self.read(key, policy, now).await?;
            let verdict = evaluate(state, policy, now);

            if self.records.compare_and_set(key.as_str(), verdict.state, version).await? {
                return Ok(verdict);
            }

            tracing::trace!(client = %key, attempt, "bucket update lost a race; retrying");
            let pause = rand::rng().random_range(0..=attempt.min(8)) as u64;
            if pause == 0 {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(Duration::from_micros(pause * 100)).await;
            }
        }

        Err(StoreError::Contention { key: key.to_string(), attempts: self.max_attempts })
    }
}

/// In-process [`RecordStore`].
#[derive(Default, Clone, Debug)]
pub struct InMemoryRecordStore {
    data: Arc<Mutex<HashMap<String, VersionedRecord>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored record, bypassing versioning.
    pub fn snapshot(&self, key: &str) -> Option<VersionedRecord> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).get(key).copied()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedRecord>, StoreError> {
        let guard = self
            .data
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory record map poisoned".into()))?;
        Ok(guard.get(key).copied())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        state: BucketState,
        expected: Option<u64>,
    ) -> Result<bool, StoreError> {
        let mut guard = self
            .data
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory record map poisoned".into()))?;

        let current = guard.get(key).map(|r| r.version);
        if current != expected {
            return Ok(false);
        }
        let version = expected.map_or(1, |v| v.wrapping_add(1));
        guard.insert(key.to_string(), VersionedRecord { state, version });
        Ok(true)
    }
}
