//! Fixed-window counter key derivation.

use std::time::Duration;

use super::policy::RateLimitPolicy;
use crate::identity::CallerIdentity;

/// Key identifying one caller's counter for one operation in one fixed window.
///
/// Two requests map to the same key exactly when they share caller, operation
/// and window epoch, which is what lets independent server processes converge
/// on a single counter in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// The protected operation
    pub operation: String,
    /// The caller the quota belongs to
    pub caller: String,
    /// `floor(now / window_seconds)`
    pub epoch: u64,
    /// Window length used to compute the epoch
    pub window_seconds: u64,
    rendered: String,
}

impl WindowKey {
    /// Derive the key for the window containing `now`.
    ///
    /// Format: `{prefix}{operation}|{caller}|{epoch}`.
    pub fn derive(
        prefix: &str,
        caller: &CallerIdentity,
        operation: &str,
        now: Duration,
        policy: &RateLimitPolicy,
    ) -> Self {
        debug_assert!(!operation.is_empty(), "operation id must not be empty");

        let window_seconds = policy.window_seconds();
        let epoch = now.as_secs() / window_seconds;
        let rendered = format!("{}{}|{}|{}", prefix, operation, caller.as_str(), epoch);

        Self {
            operation: operation.to_string(),
            caller: caller.as_str().to_string(),
            epoch,
            window_seconds,
            rendered,
        }
    }

    /// The string stored in the counter store.
    pub fn as_str(&self) -> &str {
        &self.rendered
    }

    /// Unix second at which this window opened.
    pub fn window_start_secs(&self) -> u64 {
        self.epoch * self.window_seconds
    }

    /// Unix second at which the next window opens.
    pub fn window_end_secs(&self) -> u64 {
        self.window_start_secs() + self.window_seconds
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.rendered)
    }
}
