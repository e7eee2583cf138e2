//! Seam to the authentication collaborator.
//!
//! The limiter never decodes or verifies credentials. Something upstream does that and
//! hands over a [`Verification`]; the only question asked of it is whether the caller's
//! credential independently verified. The mere presence of an `Authorization` header
//! does not count.

use http::{Extensions, HeaderMap};

/// Result of credential verification for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verification {
    /// The credential was checked and accepted.
    pub verified: bool,
    /// Authenticated principal, if any.
    pub identity: Option<String>,
}

impl Verification {
    pub fn verified(identity: impl Into<String>) -> Self {
        Self { verified: true, identity: Some(identity.into()) }
    }

    pub fn unverified() -> Self {
        Self::default()
    }
}

/// Supplies the verification result for a request.
pub trait CredentialCheck: Send + Sync {
    fn verification(&self, headers: &HeaderMap, extensions: &Extensions) -> Verification;
}

/// Reads a [`Verification`] an upstream authentication layer stored in request extensions.
///
/// Requests without one are treated as unverified.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionCheck;

impl CredentialCheck for ExtensionCheck {
    fn verification(&self, _headers: &HeaderMap, extensions: &Extensions) -> Verification {
        extensions.get::<Verification>().cloned().unwrap_or_default()
    }
}

impl<F> CredentialCheck for F
where
    F: Fn(&HeaderMap, &Extensions) -> Verification + Send + Sync,
{
    fn verification(&self, headers: &HeaderMap, extensions: &Extensions) -> Verification {
        self(headers, extensions)
    }
}
