//! Prometheus metrics sink for `tollgate`.
//! Bring your own `prometheus::Registry`; counters are registered and incremented.
//!
//! `tollgate_decisions_total{tier, outcome}` counts every admission decision. The
//! `outcome="degraded"` series is the fail-open signal: requests admitted while the
//! bucket store was unreachable.

use prometheus::{IntCounterVec, Opts, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};
use tollgate::telemetry::{AdmissionEvent, Outcome, TelemetrySink};
use tollgate::Tier;

pub const DECISIONS_METRIC: &str = "tollgate_decisions_total";

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    decisions: IntCounterVec,
}

impl PrometheusSink {
    /// Create a sink and register counters into the provided registry.
    ///
    /// # Errors
    /// Returns an error if the metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let decisions = IntCounterVec::new(
            Opts::new(DECISIONS_METRIC, "Admission decisions by tier and outcome"),
            &["tier", "outcome"],
        )?;
        registry.register(Box::new(decisions.clone()))?;
        tracing::debug!(target: "tollgate::prometheus", metric = DECISIONS_METRIC, "registered");
        Ok(Self { registry, decisions })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current count for one series.
    pub fn count(&self, tier: Tier, outcome: Outcome) -> u64 {
        self.decisions.with_label_values(&[tier.as_str(), outcome.as_str()]).get()
    }
}

impl tower_service::Service<AdmissionEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        self.decisions.with_label_values(&[event.tier().as_str(), event.outcome().as_str()]).inc();
        ready(Ok(()))
    }
}

impl TelemetrySink for PrometheusSink {
    type SinkError = Infallible;
}
