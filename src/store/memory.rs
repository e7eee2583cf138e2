use crate::bucket::{evaluate, BucketState, Verdict};
use crate::config::LimiterConfig;
use crate::error::{ConfigError, StoreError};
use crate::key::ClientKey;
use crate::policy::RateLimitPolicy;
use crate::store::BucketStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Writes between idle sweeps.
const SWEEP_EVERY: u64 = 1024;

#[derive(Clone, Copy, Debug)]
struct Slot {
    state: BucketState,
    /// Full-refill time of the tier that last wrote this record.
    full_refill: u64,
}

impl Slot {
    /// Idle past both the TTL and a full refill, so forgetting it cannot change a decision.
    fn expired(&self, ttl: u64, now: u64) -> bool {
        now.saturating_sub(self.state.last_refill_millis) >= ttl.max(self.full_refill)
    }
}

/// Single-process bucket store.
///
/// Evaluation happens while holding the map lock, so concurrent callers within this
/// process are linearized per key. It does not coordinate across processes; use a
/// shared backend for that.
#[derive(Default, Clone, Debug)]
pub struct InMemoryBucketStore {
    data: Arc<Mutex<HashMap<ClientKey, Slot>>>,
    idle_ttl: Option<u64>,
    writes: Arc<AtomicU64>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store honoring `idle_ttl_ms` from validated limiter configuration.
    pub fn from_config(config: &LimiterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(match config.idle_ttl() {
            Some(ttl) => Self::new().with_idle_ttl(ttl),
            None => Self::new(),
        })
    }

    /// Drop records untouched for `ttl`.
    ///
    /// A record is never dropped before its bucket could have refilled completely, so a
    /// `ttl` shorter than that is raised to it per record and eviction never changes a
    /// decision.
    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Stored record for `key`, if any.
    pub fn get(&self, key: &ClientKey) -> Option<BucketState> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).get(key).map(|slot| slot.state)
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every record idle for longer than the configured TTL. Returns how many were removed.
    pub fn evict_idle(&self, now: u64) -> usize {
        let Some(ttl) = self.idle_ttl else { return 0 };
        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Self::sweep(&mut guard, ttl, now)
    }

    fn sweep(map: &mut HashMap<ClientKey, Slot>, ttl: u64, now: u64) -> usize {
        let before = map.len();
        map.retain(|_, slot| !slot.expired(ttl, now));
        before - map.len()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ClientKey, Slot>>, StoreError> {
        self.data
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory bucket map poisoned".into()))
    }

    fn current(
        &self,
        map: &HashMap<ClientKey, Slot>,
        key: &ClientKey,
        policy: &RateLimitPolicy,
        now: u64,
    ) -> BucketState {
        let stored = map.get(key).filter(|slot| match self.idle_ttl {
            Some(ttl) => !slot.expired(ttl, now),
            None => true,
        });
        stored
            .and_then(|slot| {
                BucketState::restore(slot.state.tokens, slot.state.last_refill_millis, policy)
            })
            .unwrap_or_else(|| BucketState::fresh(policy, now))
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn load(
        &self,
        key: &ClientKey,
        policy: &RateLimitPolicy,
        now: u64,
    ) -> Result<BucketState, StoreError> {
        let guard = self.lock()?;
        Ok(self.current(&guard, key, policy, now))
    }

    async fn apply_and_persist(
        &self,
        key: &ClientKey,
        policy: &RateLimitPolicy,
        now: u64,
    ) -> Result<Verdict, StoreError> {
        let mut guard = self.lock()?;
        let verdict = evaluate(self.current(&guard, key, policy, now), policy, now);
        guard.insert(
            key.clone(),
            Slot { state: verdict.state, full_refill: policy.full_refill_millis() },
        );

        if let Some(ttl) = self.idle_ttl {
            if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
                let evicted = Self::sweep(&mut guard, ttl, now);
                tracing::trace!(evicted, "swept idle buckets");
            }
        }
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RateLimitPolicy {
        RateLimitPolicy::per_window(3, Duration::from_secs(3)).unwrap()
    }

    #[tokio::test]
    async fn load_does_not_write() {
        let store = InMemoryBucketStore::new();
        let key = ClientKey::new("a");
        let state = store.load(&key, &policy(), 100).await.unwrap();
        assert_eq!(state, BucketState { tokens: 3.0, last_refill_millis: 100 });
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn apply_persists_each_decision() {
        let store = InMemoryBucketStore::new();
        let key = ClientKey::new("a");
        for _ in 0..3 {
            assert!(store.apply_and_persist(&key, &policy(), 0).await.unwrap().allowed);
        }
        let denied = store.apply_and_persist(&key, &policy(), 0).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(store.get(&key), Some(denied.state));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = InMemoryBucketStore::new();
        let (a, b) = (ClientKey::new("a"), ClientKey::new("b"));
        for _ in 0..3 {
            store.apply_and_persist(&a, &policy(), 0).await.unwrap();
        }
        assert!(!store.apply_and_persist(&a, &policy(), 0).await.unwrap().allowed);
        assert!(store.apply_and_persist(&b, &policy(), 0).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn idle_records_are_evicted() {
        let store = InMemoryBucketStore::new().with_idle_ttl(Duration::from_secs(10));
        let key = ClientKey::new("a");
        store.apply_and_persist(&key, &policy(), 0).await.unwrap();
        assert_eq!(store.evict_idle(5_000), 0);
        assert_eq!(store.evict_idle(10_000), 1);
        assert!(store.get(&key).is_none());
    }

    #[tokio::test]
    async fn short_ttl_never_hands_out_a_fresh_bucket() {
        let store = InMemoryBucketStore::new().with_idle_ttl(Duration::from_millis(100));
        let key = ClientKey::new("a");
        for _ in 0..3 {
            assert!(store.apply_and_persist(&key, &policy(), 0).await.unwrap().allowed);
        }

        // One token back after a second, whatever the TTL says.
        assert_eq!(store.evict_idle(1_000), 0);
        assert!(store.apply_and_persist(&key, &policy(), 1_000).await.unwrap().allowed);
        assert!(!store.apply_and_persist(&key, &policy(), 1_000).await.unwrap().allowed);

        assert_eq!(store.evict_idle(4_000), 1);
    }

    #[test]
    fn from_config_rejects_short_ttl() {
        let config = LimiterConfig { idle_ttl_ms: Some(1_000), ..LimiterConfig::default() };
        assert!(matches!(
            InMemoryBucketStore::from_config(&config),
            Err(ConfigError::IdleTtlTooShort { .. })
        ));

        let config = LimiterConfig { idle_ttl_ms: Some(60_000), ..LimiterConfig::default() };
        let store = InMemoryBucketStore::from_config(&config).unwrap();
        assert_eq!(store.idle_ttl, Some(60_000));
    }
}
