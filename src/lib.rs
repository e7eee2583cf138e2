#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tollgate
//!
//! Distributed token-bucket admission control for HTTP services.
//!
//! Every service instance consults one shared bucket store, so a client's quota holds
//! across the whole fleet rather than per process.
//!
//! ## Features
//!
//! - **Token buckets** with continuous refill and whole-token admission
//! - **Two quota tiers** selected by an upstream credential verification
//! - **Atomic store updates** under a lock, a compare-and-set loop, or a Redis script
//! - **Fail-open** on store outages, bounded by a per-call timeout
//! - **Tower middleware** answering denials with `429` and `Retry-After`
//! - **Telemetry** through composable `tower::Service` sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate::prelude::*;
//! use std::net::SocketAddr;
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = Limiter::new(
//!     InMemoryBucketStore::new(),
//!     PolicySelector::new(RateLimitPolicy::BASELINE, RateLimitPolicy::ELEVATED),
//! );
//! let svc = RateLimitLayer::new(limiter).layer(service_fn(|_req: http::Request<String>| async {
//!     Ok::<_, std::convert::Infallible>(http::Response::new(String::from("ok")))
//! }));
//!
//! let mut req = http::Request::new(String::new());
//! req.extensions_mut().insert("192.0.2.10:4000".parse::<SocketAddr>().unwrap());
//! let res = svc.oneshot(req).await.unwrap();
//! assert_eq!(res.status(), http::StatusCode::OK);
//! # }
//! ```

pub mod bucket;
pub mod clock;
pub mod config;
pub mod credential;
pub mod error;
pub mod key;
pub mod limiter;
pub mod middleware;
pub mod policy;
pub mod prelude;
pub mod store;
pub mod telemetry;
pub mod timeout;

// Re-exports
pub use bucket::{evaluate, BucketState, Verdict};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LimiterConfig;
pub use credential::{CredentialCheck, ExtensionCheck, Verification};
pub use error::{ConfigError, PolicyError, StoreError};
pub use key::{ClientKey, ClientKeyResolver, PeerAddrResolver, FALLBACK_KEY};
pub use limiter::{Admission, Limiter, LimiterStats, StatsSnapshot};
pub use middleware::{RateLimitLayer, RateLimitService};
pub use policy::{PolicySelector, RateLimitPolicy, Tier};
pub use store::{BucketStore, CasBucketStore, InMemoryBucketStore, InMemoryRecordStore, RecordStore};
pub use timeout::StoreTimeout;
