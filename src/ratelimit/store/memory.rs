//! In-process counter store.
//!
//! Provides the same atomic increment-with-expiry contract as the shared
//! store, but only within a single process. Useful for single-node
//! deployments and for exercising the admission logic without Redis.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::{CounterSnapshot, CounterStore, StoreError};
use crate::clock::{Clock, SystemClock};

/// A single expiring counter.
#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u64,
    /// Clock reading at which the counter disappears
    expires_at: Duration,
}

impl WindowCounter {
    fn fresh(now: Duration, window: Duration) -> Self {
        Self {
            count: 0,
            expires_at: now + window,
        }
    }
}

/// Counter store held in a sharded concurrent map.
///
/// The increment runs under the shard's write lock, so concurrent first
/// requests for a key create exactly one counter with exactly one expiry.
#[derive(Debug)]
pub struct MemoryCounterStore {
    counters: DashMap<String, WindowCounter>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }

    /// Drop every counter whose window has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, counter| counter.expires_at > now);
        before.saturating_sub(self.counters.len())
    }

    /// Number of live and not-yet-purged counters.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterSnapshot, StoreError> {
        let now = self.clock.now();

        let mut counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| WindowCounter::fresh(now, window));

        if counter.expires_at <= now {
            trace!(key = %key, "Counter expired, starting a new window");
            *counter = WindowCounter::fresh(now, window);
        }

        counter.count += 1;

        Ok(CounterSnapshot {
            count: counter.count,
            ttl: Some(counter.expires_at - now),
        })
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
