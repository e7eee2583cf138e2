use crate::key::ClientKey;
use crate::policy::Tier;
use std::fmt;
use std::time::Duration;

/// Terminal state of one request in the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Allowed,
    Denied,
    /// Admitted without consulting the store.
    Degraded,
}

impl Outcome {
    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Allowed => "allowed",
            Outcome::Denied => "denied",
            Outcome::Degraded => "degraded",
        }
    }
}

/// Event emitted for every admission decision.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionEvent {
    /// The bucket had a token; the request was forwarded.
    Allowed {
        client: ClientKey,
        tier: Tier,
        /// Tokens left after this admission.
        remaining: f64,
    },
    /// The bucket was empty; the request was rejected.
    Denied {
        client: ClientKey,
        tier: Tier,
        /// Time until one token is available.
        retry_after: Duration,
    },
    /// The store failed; the request was forwarded without state changes.
    Degraded {
        client: ClientKey,
        tier: Tier,
        /// Rendered store error.
        reason: String,
    },
}

impl AdmissionEvent {
    pub fn outcome(&self) -> Outcome {
        match self {
            AdmissionEvent::Allowed { .. } => Outcome::Allowed,
            AdmissionEvent::Denied { .. } => Outcome::Denied,
            AdmissionEvent::Degraded { .. } => Outcome::Degraded,
        }
    }

    pub fn client(&self) -> &ClientKey {
        match self {
            AdmissionEvent::Allowed { client, .. }
            | AdmissionEvent::Denied { client, .. }
            | AdmissionEvent::Degraded { client, .. } => client,
        }
    }

    pub fn tier(&self) -> Tier {
        match self {
            AdmissionEvent::Allowed { tier, .. }
            | AdmissionEvent::Denied { tier, .. }
            | AdmissionEvent::Degraded { tier, .. } => *tier,
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Allowed { client, tier, remaining } => {
                write!(f, "Allowed(client={}, tier={}, remaining={:.3})", client, tier, remaining)
            }
            AdmissionEvent::Denied { client, tier, retry_after } => {
                write!(f, "Denied(client={}, tier={}, retry_after={:?})", client, tier, retry_after)
            }
            AdmissionEvent::Degraded { client, tier, reason } => {
                write!(f, "Degraded(client={}, tier={}, reason={})", client, tier, reason)
            }
        }
    }
}
