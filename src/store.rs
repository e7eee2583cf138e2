//! Bucket state accessors.
//!
//! [`BucketStore`] is the only seam that touches shared mutable state. Implementations
//! must make [`BucketStore::apply_and_persist`] a single atomic unit per key with respect
//! to every other caller of the same backing store, including callers in other processes:
//! - [`InMemoryBucketStore`] evaluates under one lock (single process only).
//! - [`CasBucketStore`] runs a compare-and-set retry loop over any [`RecordStore`].
//! - `tollgate-redis` runs the evaluation as a server-side script.
//!
//! A read-in-caller, compute, write-back sequence is not an acceptable implementation:
//! concurrent callers would all observe the same pre-decrement count and all be admitted.

use crate::bucket::{BucketState, Verdict};
use crate::error::StoreError;
use crate::key::ClientKey;
use crate::policy::RateLimitPolicy;
use async_trait::async_trait;
use std::sync::Arc;

pub mod cas;
pub mod memory;

pub use cas::{CasBucketStore, InMemoryRecordStore, RecordStore, VersionedRecord};
pub use memory::InMemoryBucketStore;

/// Loads and atomically updates per-client bucket state.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Current state for `key`, or a full bucket stamped `now` if none is stored.
    ///
    /// Never writes.
    async fn load(
        &self,
        key: &ClientKey,
        policy: &RateLimitPolicy,
        now: u64,
    ) -> Result<BucketState, StoreError>;

    /// Refill, decide, decrement and persist as one atomic unit.
    ///
    /// Admissions for a key never exceed the tokens available at decision time, across
    /// any interleaving of callers. If the caller stops polling the returned future the
    /// stored record is left either fully updated or untouched.
    async fn apply_and_persist(
        &self,
        key: &ClientKey,
        policy: &RateLimitPolicy,
        now: u64,
    ) -> Result<Verdict, StoreError>;
}

#[async_trait]
impl<S> BucketStore for Arc<S>
where
    S: BucketStore + ?Sized,
{
    async fn load(
        &self,
        key: &ClientKey,
        policy: &RateLimitPolicy,
        now: u64,
    ) -> Result<BucketState, StoreError> {
        (**self).load(key, policy, now).await
    }

    async fn apply_and_persist(
        &self,
        key: &ClientKey,
        policy: &RateLimitPolicy,
        now: u64,
    ) -> Result<Verdict, StoreError> {
        (**self).apply_and_persist(key, policy, now).await
    }
}
