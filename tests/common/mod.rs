#![allow(dead_code)]

use async_trait::async_trait;
use http::{Request, Response};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tollgate::bucket::{BucketState, Verdict};
use tollgate::{BucketStore, ClientKey, InMemoryBucketStore, PolicySelector, RateLimitPolicy, StoreError};

/// Route `tracing` output through the test harness; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn selector() -> PolicySelector {
    PolicySelector::new(RateLimitPolicy::BASELINE, RateLimitPolicy::ELEVATED)
}

/// In-memory store that can be switched off or made to hang.
#[derive(Clone, Debug, Default)]
pub struct FlakyStore {
    pub inner: InMemoryBucketStore,
    down: Arc<AtomicBool>,
    stalled: Arc<AtomicBool>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    async fn gate(&self) -> Result<(), StoreError> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BucketStore for FlakyStore {
    async fn load(
        &self,
        key: &ClientKey,
        policy: &RateLimitPolicy,
        now: u64,
    ) -> Result<BucketState, StoreError> {
        self.gate().await?;
        self.inner.load(key, policy, now).await
    }

    async fn apply_and_persist(
        &self,
        key: &ClientKey,
        policy: &RateLimitPolicy,
        now: u64,
    ) -> Result<Verdict, StoreError> {
        self.gate().await?;
        self.inner.apply_and_persist(key, policy, now).await
    }
}

/// Request arriving from `peer`.
pub fn request_from(peer: &str) -> Request<String> {
    let mut req = Request::new(String::new());
    req.extensions_mut().insert(peer.parse::<SocketAddr>().expect("valid socket addr"));
    req
}

/// Downstream handler that counts how often it runs.
#[derive(Clone, Debug, Default)]
pub struct Counting {
    pub hits: Arc<AtomicUsize>,
}

impl Counting {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl tower::Service<Request<String>> for Counting {
    type Response = Response<String>;
    type Error = Infallible;
    type Future = std::future::Ready<Result<Response<String>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<String>) -> Self::Future {
        self.hits.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(Response::new("ok".to_string())))
    }
}
