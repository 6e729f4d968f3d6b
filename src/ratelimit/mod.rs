//! Fixed-window admission control backed by a shared counter store.

mod evaluator;
mod limiter;
mod policy;
mod store;
mod window;

pub use evaluator::{AdmissionEvaluator, FailureMode, Verdict, DEFAULT_STORE_TIMEOUT};
pub use limiter::{RateLimiter, SharedRateLimiter, DEFAULT_KEY_PREFIX};
pub use policy::{PolicyError, PolicyRegistry, PolicyRule, RateLimitPolicy};
pub use store::{
    CounterSnapshot, CounterStore, MemoryCounterStore, RedisCounterStore, RedisStoreConfig,
    StoreError,
};
pub use window::WindowKey;
