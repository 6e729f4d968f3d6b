//! Admission middleware for protected routes.
//!
//! Each route is wrapped with an [`AdmissionGuard`] naming its operation id.
//! The guard resolves the caller first, so unidentified requests never touch a
//! counter, then consults the rate limiter and either hands the request to
//! the next handler or answers on its behalf.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::MethodRouter;
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::identity::{CallerIdentity, IdentityError, IdentityResolver};
use crate::ratelimit::{SharedRateLimiter, Verdict};

/// Quota for the current window, set on admitted responses of protected routes.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Requests left in the current window.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// A request that passed admission.
#[derive(Debug, Clone)]
pub struct Admission {
    pub caller: CallerIdentity,
    /// `None` when the operation has no policy
    pub verdict: Option<Verdict>,
}

/// Why a request was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The caller could not be identified
    Unauthenticated(IdentityError),
    /// The caller is over quota, or the store is down and failing closed
    Throttled(Verdict),
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::Unauthenticated(err) => (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "unauthenticated",
                    "detail": err.to_string(),
                })),
            )
                .into_response(),
            Rejection::Throttled(verdict) => (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, HeaderValue::from(verdict.retry_after_seconds))],
                Json(json!({
                    "error": "too_many_requests",
                    "detail": "Rate limit exceeded, retry later",
                    "retry_after_seconds": verdict.retry_after_seconds,
                })),
            )
                .into_response(),
        }
    }
}

/// Admission state for one protected operation.
#[derive(Clone)]
pub struct AdmissionGuard {
    limiter: SharedRateLimiter,
    resolver: Arc<dyn IdentityResolver>,
    operation: Arc<str>,
}

impl AdmissionGuard {
    pub fn new(
        limiter: SharedRateLimiter,
        resolver: Arc<dyn IdentityResolver>,
        operation: &str,
    ) -> Self {
        Self {
            limiter,
            resolver,
            operation: Arc::from(operation),
        }
    }

    /// Same limiter and resolver, different operation.
    pub fn for_operation(&self, operation: &str) -> Self {
        Self {
            limiter: self.limiter.clone(),
            resolver: self.resolver.clone(),
            operation: Arc::from(operation),
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Resolve the caller of `request`.
    ///
    /// Runs before any counter is touched and never awaits, so the request
    /// borrow ends here.
    pub fn identify(&self, request: &Request) -> Result<CallerIdentity, Rejection> {
        self.resolver.resolve(request).map_err(|err| {
            debug!(operation = %self.operation, error = %err, "Caller identity not resolved");
            Rejection::Unauthenticated(err)
        })
    }

    /// Count one request by `caller` and decide whether it may proceed.
    pub async fn admit(&self, caller: CallerIdentity) -> Result<Admission, Rejection> {
        let verdict = self.limiter.check(&caller, &self.operation).await;
        match verdict {
            Some(v) if !v.allowed => {
                debug!(
                    operation = %self.operation,
                    caller = %caller,
                    retry_after_seconds = v.retry_after_seconds,
                    degraded = v.degraded,
                    "Request throttled"
                );
                Err(Rejection::Throttled(v))
            }
            _ => Ok(Admission { caller, verdict }),
        }
    }

    /// Wrap `route` so every request passes through this guard.
    pub fn wrap<S>(self, route: MethodRouter<S>) -> MethodRouter<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        route.route_layer(middleware::from_fn_with_state(self, enforce))
    }
}

/// Interceptor: admit and forward to `next`, or reject.
///
/// Admitted requests carry the [`CallerIdentity`] as an extension for the
/// downstream handler.
pub async fn enforce(
    State(guard): State<AdmissionGuard>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let caller = match guard.identify(&request) {
        Ok(caller) => caller,
        Err(rejection) => return rejection.into_response(),
    };

    match guard.admit(caller).await {
        Ok(Admission { caller, verdict }) => {
            request.extensions_mut().insert(caller);
            let mut response = next.run(request).await;

            if let Some(verdict) = verdict.filter(|v| !v.degraded) {
                let headers = response.headers_mut();
                headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(verdict.limit));
                headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(verdict.remaining()));
            }
            response
        }
        Err(rejection) => rejection.into_response(),
    }
}
