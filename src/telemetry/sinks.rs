use super::events::{AdmissionEvent, Outcome};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tower::{Service, ServiceExt};

/// Consumer of admission events.
///
/// Any cloneable `tower::Service<AdmissionEvent>` qualifies once it names its error type.
pub trait TelemetrySink:
    Service<AdmissionEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    type SinkError: std::error::Error + Send + 'static;
}

/// Deliver `event` if `sink` becomes ready; drop it otherwise.
///
/// Admission never waits on a failing sink and never surfaces its errors.
pub async fn emit_best_effort<S>(sink: S, event: AdmissionEvent)
where
    S: Service<AdmissionEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    match sink.ready_oneshot().await {
        Ok(mut sink) => {
            if let Err(error) = sink.call(event).await {
                tracing::trace!(target: "tollgate::admission", %error, "telemetry sink failed");
            }
        }
        Err(error) => {
            tracing::trace!(target: "tollgate::admission", %error, "telemetry sink not ready");
        }
    }
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl Service<AdmissionEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: AdmissionEvent) -> Self::Future {
        ready(Ok(()))
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Writes events through `tracing` under the `tollgate::admission` target.
///
/// Degraded admissions log at `WARN` so store outages surface without a metrics stack;
/// allow/deny decisions log at `DEBUG`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl Service<AdmissionEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        match &event {
            AdmissionEvent::Allowed { client, tier, remaining } => tracing::debug!(
                target: "tollgate::admission",
                client = %client,
                tier = %tier,
                remaining,
                "allowed"
            ),
            AdmissionEvent::Denied { client, tier, retry_after } => tracing::debug!(
                target: "tollgate::admission",
                client = %client,
                tier = %tier,
                retry_after_ms = retry_after.as_millis() as u64,
                "denied"
            ),
            AdmissionEvent::Degraded { client, tier, reason } => tracing::warn!(
                target: "tollgate::admission",
                client = %client,
                tier = %tier,
                reason = %reason,
                "store unavailable; admitting without a bucket check"
            ),
        }
        ready(Ok(()))
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps the most recent events in memory for inspection.
///
/// Once `capacity` events are held, each new one pushes out the oldest.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<AdmissionEvent>>>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl MemorySink {
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<AdmissionEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Held events, oldest first.
    pub fn events(&self) -> Vec<AdmissionEvent> {
        self.buffer().iter().cloned().collect()
    }

    /// How many held events have `outcome`.
    pub fn count(&self, outcome: Outcome) -> usize {
        self.buffer().iter().filter(|e| e.outcome() == outcome).count()
    }

    pub fn len(&self) -> usize {
        self.buffer().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer().is_empty()
    }

    pub fn clear(&self) {
        self.buffer().clear();
    }

    /// Events pushed out by newer ones.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<AdmissionEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let mut buffer = self.buffer();
        if buffer.len() == self.capacity {
            buffer.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        buffer.push_back(event);
        ready(Ok(()))
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Sends every event to two sinks, e.g. logs plus metrics.
///
/// Each side is fed best-effort: a failing side neither blocks nor fails the other.
#[derive(Clone, Debug)]
pub struct FanoutSink<A, B> {
    first: A,
    second: B,
}

impl<A, B> FanoutSink<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A, B> Service<AdmissionEvent> for FanoutSink<A, B>
where
    A: TelemetrySink,
    A::Future: Send + 'static,
    B: TelemetrySink,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let first = emit_best_effort(self.first.clone(), event.clone());
        let second = emit_best_effort(self.second.clone(), event);
        Box::pin(async move {
            tokio::join!(first, second);
            Ok(())
        })
    }
}

impl<A, B> TelemetrySink for FanoutSink<A, B>
where
    A: TelemetrySink,
    A::Future: Send + 'static,
    B: TelemetrySink,
    B::Future: Send + 'static,
{
    type SinkError = Infallible;
}
