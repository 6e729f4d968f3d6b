//! Admission evaluator: the allow/deny decision for one window key.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::policy::RateLimitPolicy;
use super::store::{CounterSnapshot, CounterStore, StoreError};
use super::window::WindowKey;
use crate::clock::Clock;

/// Default deadline for a single counter store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);

/// Behavior when the counter store cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Admit the request
    #[default]
    FailOpen,
    /// Reject the request as throttled
    FailClosed,
}

/// Outcome of one admission evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    /// Counter value after this request; 0 when the store was not consulted
    pub current_count: u64,
    /// Seconds until the caller may retry; 0 for allowed verdicts
    pub retry_after_seconds: u64,
    /// Quota the verdict was computed against
    pub limit: u64,
    /// Set when the decision came from the failure mode instead of the store
    pub degraded: bool,
}

impl Verdict {
    /// Requests left in the current window.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.current_count)
    }
}

/// Decides whether a request fits in its window.
///
/// Holds no counter state of its own. Each evaluation is a single atomic
/// increment against the shared store, attempted at most once and bounded by
/// a timeout.
pub struct AdmissionEvaluator {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    failure_mode: FailureMode,
    timeout: Duration,
}

impl AdmissionEvaluator {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            failure_mode: FailureMode::default(),
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Count this request against `key` and compare with `policy`.
    pub async fn evaluate(&self, key: &WindowKey, policy: &RateLimitPolicy) -> Verdict {
        trace!(key = %key, limit = policy.max_requests(), "Evaluating admission");

        let snapshot = match tokio::time::timeout(
            self.timeout,
            self.store.increment(key.as_str(), policy.window()),
        )
        .await
        {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(err)) => return self.degraded(key, policy, &err),
            // The increment may have landed; it is not retried.
            Err(_) => return self.degraded(key, policy, &StoreError::Timeout(self.timeout)),
        };

        let limit = policy.max_requests();
        if snapshot.count <= limit {
            return Verdict {
                allowed: true,
                current_count: snapshot.count,
                retry_after_seconds: 0,
                limit,
                degraded: false,
            };
        }

        let retry_after_seconds = self.retry_after(key, policy, &snapshot);
        debug!(
            key = %key,
            count = snapshot.count,
            limit = limit,
            retry_after_seconds = retry_after_seconds,
            "Rate limit exceeded"
        );

        Verdict {
            allowed: false,
            current_count: snapshot.count,
            retry_after_seconds,
            limit,
            degraded: false,
        }
    }

    /// Seconds until a retry can land in a fresh window.
    ///
    /// The key's TTL bounds it, and so does the next window boundary, since a
    /// request after the boundary derives a new key. Never below 1.
    fn retry_after(&self, key: &WindowKey, policy: &RateLimitPolicy, snapshot: &CounterSnapshot) -> u64 {
        let by_ttl = snapshot
            .ttl
            .map(ceil_secs)
            .unwrap_or_else(|| policy.window_seconds());

        let window_end = Duration::from_secs(key.window_end_secs());
        let by_boundary = ceil_secs(window_end.saturating_sub(self.clock.now()));

        by_ttl.min(by_boundary).max(1)
    }

    fn degraded(&self, key: &WindowKey, policy: &RateLimitPolicy, err: &StoreError) -> Verdict {
        warn!(
            key = %key,
            backend = self.store.backend(),
            failure_mode = ?self.failure_mode,
            degraded = true,
            error = %err,
            "Counter store unavailable, applying failure mode"
        );

        match self.failure_mode {
            FailureMode::FailOpen => Verdict {
                allowed: true,
                current_count: 0,
                retry_after_seconds: 0,
                limit: policy.max_requests(),
                degraded: true,
            },
            FailureMode::FailClosed => Verdict {
                allowed: false,
                current_count: 0,
                retry_after_seconds: 1,
                limit: policy.max_requests(),
                degraded: true,
            },
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
