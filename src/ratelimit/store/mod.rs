//! Shared counter store abstraction.
//!
//! The admission evaluator never reads and then writes a counter itself. All
//! coordination between server processes is delegated to the store's atomic
//! increment, so every implementation must perform "increment, set expiry if
//! new, report count and TTL" as one indivisible step.

mod memory;
mod redis_store;

pub use memory::MemoryCounterStore;
pub use redis_store::{RedisCounterStore, RedisStoreConfig};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or rejected the command
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the configured deadline
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with something other than a count and a TTL
    #[error("unexpected counter store reply: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.kind() == redis::ErrorKind::TypeError {
            StoreError::Protocol(err.to_string())
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

/// Counter state observed immediately after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Value after this increment
    pub count: u64,
    /// Remaining lifetime of the key, `None` if the store reports no expiry
    pub ttl: Option<Duration>,
}

/// An atomic, expiring counter service shared by every server process.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` by one and report the resulting count and TTL.
    ///
    /// If the key does not exist it is created with value 1 and expiry
    /// `window`. Existing keys keep their original expiry.
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterSnapshot, StoreError>;

    /// Short backend name used in logs.
    fn backend(&self) -> &'static str;
}
