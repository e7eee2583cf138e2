//! Telemetry for admission decisions.
//!
//! Every request that reaches the limiter produces one [`AdmissionEvent`]. Events flow
//! through `TelemetrySink` implementations which can log, aggregate, or forward them to
//! external systems.
//!
//! `Degraded` events are the monitoring hook for store outages: they mark requests that
//! were admitted without consulting the shared store.
//!
//! # Telemetry Sinks
//!
//! The `TelemetrySink` trait defines how events are consumed. It's implemented
//! as a `tower::Service<AdmissionEvent>` for composability.
//!
//! ```rust
//! use tollgate::telemetry::{AdmissionEvent, MemorySink};
//! use tollgate::{ClientKey, Tier};
//! use tower::Service;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut sink = MemorySink::with_capacity(16);
//! sink.call(AdmissionEvent::Degraded {
//!     client: ClientKey::new("203.0.113.9"),
//!     tier: Tier::Baseline,
//!     reason: "store unavailable: connection refused".into(),
//! })
//! .await
//! .unwrap();
//! assert_eq!(sink.len(), 1);
//! # }
//! ```

pub mod events;
pub mod sinks;

pub use events::{AdmissionEvent, Outcome};
pub use sinks::{emit_best_effort, FanoutSink, LogSink, MemorySink, NullSink, TelemetrySink};
