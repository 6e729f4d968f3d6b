//! Rate limit policies and the per-operation policy table.
//!
//! Every protected operation declares exactly one policy at startup. Policies
//! are validated when they are registered, so a misconfigured quota stops the
//! server before it accepts traffic rather than surfacing at request time.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::error::{Result, TaskgateError};

/// Reasons a policy is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("max_requests must be positive, got {0}")]
    MaxRequests(i64),
    #[error("window_seconds must be positive, got {0}")]
    WindowSeconds(i64),
}

/// A policy as written in configuration.
///
/// Values are signed so that negative input reaches validation and is
/// reported as an invalid policy instead of a parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Number of requests allowed per window
    pub max_requests: i64,
    /// Window length in seconds
    pub window_seconds: i64,
}

impl PolicyRule {
    pub fn new(max_requests: i64, window_seconds: i64) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }
}

/// A validated fixed-window quota: at most `max_requests` per `window_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateLimitPolicy {
    max_requests: u64,
    window_seconds: u64,
}

impl RateLimitPolicy {
    /// Create a policy, rejecting zero values.
    pub fn new(max_requests: u64, window_seconds: u64) -> std::result::Result<Self, PolicyError> {
        if max_requests == 0 {
            return Err(PolicyError::MaxRequests(0));
        }
        if window_seconds == 0 {
            return Err(PolicyError::WindowSeconds(0));
        }
        Ok(Self {
            max_requests,
            window_seconds,
        })
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    /// The window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

impl TryFrom<PolicyRule> for RateLimitPolicy {
    type Error = PolicyError;

    fn try_from(rule: PolicyRule) -> std::result::Result<Self, Self::Error> {
        if rule.max_requests <= 0 {
            return Err(PolicyError::MaxRequests(rule.max_requests));
        }
        if rule.window_seconds <= 0 {
            return Err(PolicyError::WindowSeconds(rule.window_seconds));
        }
        RateLimitPolicy::new(rule.max_requests as u64, rule.window_seconds as u64)
    }
}

/// Static mapping from operation identifier to its policy.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, RateLimitPolicy>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configured rules, failing on the first invalid one.
    pub fn from_rules(rules: &BTreeMap<String, PolicyRule>) -> Result<Self> {
        let mut registry = Self::new();
        for (operation, rule) in rules {
            registry.register_rule(operation, *rule)?;
        }
        Ok(registry)
    }

    /// Attach a policy to a protected operation.
    ///
    /// Each operation may be registered once.
    pub fn register_policy(&mut self, operation: &str, policy: RateLimitPolicy) -> Result<()> {
        if operation.trim().is_empty() {
            return Err(TaskgateError::invalid_policy(
                operation,
                "operation id must not be empty",
            ));
        }
        if operation.contains('|') {
            return Err(TaskgateError::invalid_policy(
                operation,
                "operation id must not contain '|'",
            ));
        }
        if self.policies.contains_key(operation) {
            return Err(TaskgateError::invalid_policy(
                operation,
                "a policy is already registered for this operation",
            ));
        }

        info!(
            operation = %operation,
            max_requests = policy.max_requests(),
            window_seconds = policy.window_seconds(),
            "Registered rate limit policy"
        );
        self.policies.insert(operation.to_string(), policy);
        Ok(())
    }

    /// Validate a configured rule and register it.
    pub fn register_rule(&mut self, operation: &str, rule: PolicyRule) -> Result<()> {
        let policy = RateLimitPolicy::try_from(rule)
            .map_err(|e| TaskgateError::invalid_policy(operation, e.to_string()))?;
        self.register_policy(operation, policy)
    }

    /// Look up the policy for an operation. `None` means the operation is unprotected.
    pub fn get(&self, operation: &str) -> Option<&RateLimitPolicy> {
        self.policies.get(operation)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_policy_rejects_zero_values() {
        assert_eq!(RateLimitPolicy::new(0, 10), Err(PolicyError::MaxRequests(0)));
        assert_eq!(RateLimitPolicy::new(5, 0), Err(PolicyError::WindowSeconds(0)));

        let policy = assert_ok!(RateLimitPolicy::new(5, 10));
        assert_eq!(policy.window(), Duration::from_secs(10));
    }

    #[test]
    fn test_rule_conversion_rejects_negative_values() {
        assert_eq!(
            RateLimitPolicy::try_from(PolicyRule::new(-1, 10)),
            Err(PolicyError::MaxRequests(-1))
        );
        assert_eq!(
            RateLimitPolicy::try_from(PolicyRule::new(5, -10)),
            Err(PolicyError::WindowSeconds(-10))
        );
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = PolicyRegistry::new();
        assert_ok!(registry.register_rule("tasks.create", PolicyRule::new(5, 10)));

        let policy = registry.get("tasks.create").unwrap();
        assert_eq!(policy.max_requests(), 5);
        assert_eq!(policy.window_seconds(), 10);
        assert!(registry.get("tasks.list").is_none());
    }

    #[test]
    fn test_invalid_rule_is_reported_with_operation() {
        let mut registry = PolicyRegistry::new();
        let err = assert_err!(registry.register_rule("tasks.create", PolicyRule::new(0, 10)));

        match err {
            TaskgateError::InvalidPolicy { operation, reason } => {
                assert_eq!(operation, "tasks.create");
                assert!(reason.contains("max_requests"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_and_empty_operations_rejected() {
        let mut registry = PolicyRegistry::new();
        let policy = RateLimitPolicy::new(1, 1).unwrap();

        assert_ok!(registry.register_policy("tasks.delete", policy));
        assert_err!(registry.register_policy("tasks.delete", policy));
        assert_err!(registry.register_policy("  ", policy));
        assert_err!(registry.register_policy("tasks|delete", policy));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_from_rules_fails_fast() {
        let mut rules = BTreeMap::new();
        rules.insert("a".to_string(), PolicyRule::new(3, 60));
        rules.insert("b".to_string(), PolicyRule::new(3, 0));

        assert!(PolicyRegistry::from_rules(&rules).is_err());

        rules.remove("b");
        let registry = PolicyRegistry::from_rules(&rules).unwrap();
        assert_eq!(registry.len(), 1);
    }
}
