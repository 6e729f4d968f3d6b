//! Per-operation rate limiter.

use std::sync::Arc;
use tracing::trace;

use super::evaluator::{AdmissionEvaluator, Verdict};
use super::policy::{PolicyRegistry, RateLimitPolicy};
use super::window::WindowKey;
use crate::identity::CallerIdentity;

/// Default namespace for counter keys in the shared store.
pub const DEFAULT_KEY_PREFIX: &str = "taskgate:rl:";

/// Ties the policy table, key derivation and the evaluator together.
///
/// This struct is immutable after construction and can be shared across
/// tasks behind an `Arc`.
pub struct RateLimiter {
    policies: PolicyRegistry,
    evaluator: AdmissionEvaluator,
    key_prefix: String,
}

impl RateLimiter {
    pub fn new(policies: PolicyRegistry, evaluator: AdmissionEvaluator) -> Self {
        Self {
            policies,
            evaluator,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Whether `operation` has a registered policy.
    pub fn is_protected(&self, operation: &str) -> bool {
        self.policies.get(operation).is_some()
    }

    pub fn policy(&self, operation: &str) -> Option<&RateLimitPolicy> {
        self.policies.get(operation)
    }

    /// Derive the key `caller` would hit for `operation` right now.
    pub fn window_key(&self, caller: &CallerIdentity, operation: &str) -> Option<WindowKey> {
        let policy = self.policies.get(operation)?;
        let now = self.evaluator.clock().now();
        Some(WindowKey::derive(&self.key_prefix, caller, operation, now, policy))
    }

    /// Count one request by `caller` against `operation`.
    ///
    /// Returns `None` for operations without a policy; those are never counted.
    pub async fn check(&self, caller: &CallerIdentity, operation: &str) -> Option<Verdict> {
        let Some(policy) = self.policies.get(operation) else {
            trace!(operation = %operation, "Operation not rate limited");
            return None;
        };

        let now = self.evaluator.clock().now();
        let key = WindowKey::derive(&self.key_prefix, caller, operation, now, policy);
        Some(self.evaluator.evaluate(&key, policy).await)
    }
}

/// Shared handle used by the HTTP layer.
pub type SharedRateLimiter = Arc<RateLimiter>;
