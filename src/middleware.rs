//! HTTP admission middleware.

use crate::credential::{CredentialCheck, ExtensionCheck};
use crate::key::{ClientKeyResolver, PeerAddrResolver};
use crate::limiter::{Admission, Limiter};
use crate::telemetry::TelemetrySink;
use futures::future::BoxFuture;
use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderValue, Request, Response, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// Message carried in the rejection body.
pub const REJECTION_MESSAGE: &str = "Too many requests per minute";

/// A layer that admits or rejects HTTP requests through a shared [`Limiter`].
pub struct RateLimitLayer<T> {
    limiter: Arc<Limiter<T>>,
    resolver: Arc<dyn ClientKeyResolver>,
    credentials: Arc<dyn CredentialCheck>,
}

impl<T> Clone for RateLimitLayer<T> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            resolver: self.resolver.clone(),
            credentials: self.credentials.clone(),
        }
    }
}

impl<T> fmt::Debug for RateLimitLayer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer").field("limiter", &self.limiter).finish_non_exhaustive()
    }
}

impl<T> RateLimitLayer<T> {
    /// Keyed by peer address, tiered by an upstream [`Verification`](crate::Verification).
    pub fn new(limiter: Limiter<T>) -> Self {
        Self::shared(Arc::new(limiter))
    }

    /// Share one limiter between several layers.
    pub fn shared(limiter: Arc<Limiter<T>>) -> Self {
        Self {
            limiter,
            resolver: Arc::new(PeerAddrResolver::new()),
            credentials: Arc::new(ExtensionCheck),
        }
    }

    pub fn with_resolver<R: ClientKeyResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn with_credentials<C: CredentialCheck + 'static>(mut self, credentials: C) -> Self {
        self.credentials = Arc::new(credentials);
        self
    }

    pub fn limiter(&self) -> &Arc<Limiter<T>> {
        &self.limiter
    }
}

impl<S, T> Layer<S> for RateLimitLayer<T> {
    type Service = RateLimitService<S, T>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            resolver: self.resolver.clone(),
            credentials: self.credentials.clone(),
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
///
/// Denied requests are answered with `429 Too Many Requests` and never reach `inner`.
/// Allowed and degraded requests are forwarded unchanged.
pub struct RateLimitService<S, T> {
    inner: S,
    limiter: Arc<Limiter<T>>,
    resolver: Arc<dyn ClientKeyResolver>,
    credentials: Arc<dyn CredentialCheck>,
}

impl<S: Clone, T> Clone for RateLimitService<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            resolver: self.resolver.clone(),
            credentials: self.credentials.clone(),
        }
    }
}

impl<S: fmt::Debug, T> fmt::Debug for RateLimitService<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitService")
            .field("inner", &self.inner)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl<S, T, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S, T>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    T: TelemetrySink + Sync,
    T::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let key = self.resolver.resolve(req.headers(), req.extensions());
        let verified = self.credentials.verification(req.headers(), req.extensions()).verified;
        let limiter = self.limiter.clone();

        // The readied service goes into the future; a fresh clone stays behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match limiter.check(&key, verified).await {
                Admission::Denied { retry_after, .. } => Ok(too_many_requests(retry_after)),
                Admission::Allowed { .. } | Admission::Degraded { .. } => inner.call(req).await,
            }
        })
    }
}

/// Whole seconds until retry, rounded up, never below one.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

/// Build the rejection response.
pub fn too_many_requests<B: From<String>>(retry_after: Duration) -> Response<B> {
    let body = serde_json::json!({ "error": REJECTION_MESSAGE }).to_string();
    let mut response = Response::new(B::from(body));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(retry_after)));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(100)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(6_000)), 6);
        assert_eq!(retry_after_secs(Duration::from_millis(6_001)), 7);
    }

    #[test]
    fn rejection_shape() {
        let res: Response<String> = too_many_requests(Duration::from_millis(2_500));
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(res.headers()[RETRY_AFTER], "3");
        let body: serde_json::Value = serde_json::from_str(res.body()).unwrap();
        assert_eq!(body, serde_json::json!({ "error": "Too many requests per minute" }));
    }
}
