//! Convenient re-exports for common tollgate types.
pub use crate::{
    clock::{Clock, ManualClock, SystemClock},
    credential::{CredentialCheck, ExtensionCheck, Verification},
    error::StoreError,
    key::{ClientKey, ClientKeyResolver, PeerAddrResolver},
    limiter::{Admission, Limiter},
    middleware::{RateLimitLayer, RateLimitService},
    policy::{PolicySelector, RateLimitPolicy, Tier},
    store::{BucketStore, CasBucketStore, InMemoryBucketStore},
    telemetry::{FanoutSink, LogSink, MemorySink, NullSink, TelemetrySink},
    timeout::StoreTimeout,
    LimiterConfig,
};
