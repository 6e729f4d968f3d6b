//! Assembly of the service from configuration.

use axum::http::HeaderName;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{StoreBackend, TaskBackend, TaskgateConfig};
use crate::error::{Result, TaskgateError};
use crate::http::AdmissionGuard;
use crate::identity::{HeaderIdentityResolver, IdentityResolver};
use crate::ratelimit::{
    AdmissionEvaluator, CounterStore, MemoryCounterStore, RateLimiter, RedisCounterStore,
    RedisStoreConfig, SharedRateLimiter,
};
use crate::tasks::{self, InMemoryTaskStore, SqliteTaskStore, TaskStore};

/// How often expired counters are swept from the in-process store.
const MEMORY_PURGE_INTERVAL: Duration = Duration::from_secs(30);

/// Create the configured counter store.
///
/// With the Redis backend an unreachable server is logged and tolerated;
/// requests then follow the configured failure mode until it comes back.
pub async fn counter_store(config: &TaskgateConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn CounterStore>> {
    match config.counter_store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryCounterStore::with_clock(clock));
            spawn_purge_task(store.clone(), MEMORY_PURGE_INTERVAL);
            warn!("Using in-process counter store; quotas are not shared between processes");
            Ok(store)
        }
        StoreBackend::Redis => {
            let store = RedisCounterStore::new(RedisStoreConfig {
                url: config.counter_store.url.clone(),
            })?;

            match tokio::time::timeout(Duration::from_secs(2), store.ping()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    url = %config.counter_store.url,
                    error = %e,
                    failure_mode = ?config.rate_limiting.failure_mode,
                    "Counter store unreachable at startup"
                ),
                Err(_) => warn!(
                    url = %config.counter_store.url,
                    failure_mode = ?config.rate_limiting.failure_mode,
                    "Counter store did not answer at startup"
                ),
            }
            Ok(Arc::new(store))
        }
    }
}

/// Validate policies and build the shared rate limiter.
pub fn rate_limiter(
    config: &TaskgateConfig,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
) -> Result<SharedRateLimiter> {
    config.validate()?;
    let policies = config.rate_limiting.policy_registry()?;
    let evaluator = AdmissionEvaluator::new(store, clock)
        .with_failure_mode(config.rate_limiting.failure_mode)
        .with_timeout(config.counter_store.timeout());

    info!(
        policies = policies.len(),
        failure_mode = ?config.rate_limiting.failure_mode,
        timeout_ms = config.counter_store.timeout_ms,
        "Rate limiter initialized"
    );

    Ok(Arc::new(
        RateLimiter::new(policies, evaluator).with_key_prefix(config.counter_store.key_prefix.clone()),
    ))
}

/// Open the configured task store.
pub async fn task_store(config: &TaskgateConfig) -> Result<Arc<dyn TaskStore>> {
    match config.task_store.backend {
        TaskBackend::Memory => {
            warn!("Using in-process task store; tasks are lost on restart");
            Ok(Arc::new(InMemoryTaskStore::new()))
        }
        TaskBackend::Sqlite => {
            let store =
                SqliteTaskStore::connect(&config.task_store.url, config.task_store.max_connections)
                    .await?;
            Ok(Arc::new(store))
        }
    }
}

/// Build the identity resolver described by the configuration.
pub fn identity_resolver(config: &TaskgateConfig) -> Result<Arc<dyn IdentityResolver>> {
    let header = HeaderName::try_from(config.rate_limiting.identity_header.as_str())
        .map_err(|e| TaskgateError::Config(format!("invalid identity_header: {e}")))?;
    let resolver = HeaderIdentityResolver::new(header, &config.rate_limiting.anonymous)
        .map_err(|e| TaskgateError::Config(format!("invalid anonymous policy: {e}")))?;
    Ok(Arc::new(resolver))
}

/// Build the full application router.
pub fn router(
    config: &TaskgateConfig,
    limiter: SharedRateLimiter,
    task_store: Arc<dyn TaskStore>,
) -> Result<Router> {
    let resolver = identity_resolver(config)?;
    let guard = AdmissionGuard::new(limiter, resolver, crate::config::OP_TASKS_CREATE);
    Ok(tasks::router(task_store, &guard))
}

fn spawn_purge_task(store: Arc<MemoryCounterStore>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                debug!(purged = purged, "Purged expired counters");
            }
        }
    });
}
