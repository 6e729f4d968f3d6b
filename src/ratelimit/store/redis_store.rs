//! Redis-backed counter store.
//!
//! Every server process points at the same Redis instance, so the counters it
//! holds are the single source of truth for admission decisions.
//!
//! ## Atomicity
//!
//! Increment, first-hit expiry and TTL read-back run inside one Lua script.
//! Redis executes scripts without interleaving other commands, so concurrent
//! first requests for a key produce exactly one `PEXPIRE` and the count always
//! equals the number of completed increments.
//!
//! ## Connection handling
//!
//! The connection is established lazily on first use through a
//! `ConnectionManager`, which reconnects on its own after failures. A server
//! therefore starts even when Redis is down; the affected requests then go
//! through the configured failure mode.
//!
//! Setup runs in its own task. Callers bound each increment with a short
//! timeout, and a caller that gives up must not abort a handshake that the
//! next request would otherwise have to start over.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{CounterSnapshot, CounterStore, StoreError};

/// `KEYS[1]` = counter key, `ARGV[1]` = window in milliseconds.
/// Returns `{count, pttl}`.
///
/// A fresh key has no expiry after `INCR`, and neither does a key another
/// client wrote without one. Both get the window as their expiry.
const INCREMENT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl == -1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {current, ttl}
"#;

/// Configuration for the Redis counter store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6380/`
    pub url: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6380/".to_string(),
        }
    }
}

/// Shared counter store on top of Redis.
pub struct RedisCounterStore {
    client: Client,
    connection: Arc<OnceCell<ConnectionManager>>,
    script: Script,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("config", &self.config)
            .field("connected", &self.connection.initialized())
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Create a store for `config.url` without connecting yet.
    ///
    /// # Errors
    /// Returns an error if the URL cannot be parsed.
    pub fn new(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            connection: Arc::new(OnceCell::new()),
            script: Script::new(INCREMENT_SCRIPT),
            config,
        })
    }

    /// Create a store and establish the connection immediately.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let store = Self::new(config)?;
        store.ping().await?;
        Ok(store)
    }

    /// Round-trip a `PING`, establishing the connection if needed.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(reply = %reply, url = %self.config.url, "Counter store reachable");
        Ok(())
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        if let Some(conn) = self.connection.get() {
            return Ok(conn.clone());
        }

        let cell = self.connection.clone();
        let client = self.client.clone();
        let url = self.config.url.clone();
        let setup = tokio::spawn(async move {
            cell.get_or_try_init(|| async {
                let manager = ConnectionManager::new(client).await?;
                info!(url = %url, "Connected to Redis counter store");
                Ok::<_, redis::RedisError>(manager)
            })
            .await
            .cloned()
        });

        setup
            .await
            .map_err(|e| StoreError::Unavailable(format!("connection task failed: {e}")))?
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterSnapshot, StoreError> {
        let mut conn = self.connection().await?;
        let window_ms = window.as_millis().max(1) as u64;

        let (count, ttl_ms): (i64, i64) = self
            .script
            .key(key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        if count < 1 {
            return Err(StoreError::Protocol(format!(
                "counter {key} reported non-positive value {count}"
            )));
        }

        let ttl = (ttl_ms >= 0).then(|| Duration::from_millis(ttl_ms as u64));
        Ok(CounterSnapshot {
            count: count as u64,
            ttl,
        })
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_rejected() {
        let result = RedisCounterStore::new(RedisStoreConfig {
            url: "not a url".to_string(),
        });
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn test_new_does_not_connect() {
        // Nothing listens on port 1; construction must still succeed.
        let store = RedisCounterStore::new(RedisStoreConfig {
            url: "redis://127.0.0.1:1/".to_string(),
        })
        .unwrap();
        assert!(!store.connection.initialized());
        assert_eq!(store.backend(), "redis");
    }

    #[tokio::test]
    async fn test_cancelled_requests_do_not_restart_connection_setup() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::net::TcpListener;

        // Accepts connections but never answers, so the handshake hangs.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(socket);
            }
        });

        let store = RedisCounterStore::new(RedisStoreConfig {
            url: format!("redis://{addr}/"),
        })
        .unwrap();

        for _ in 0..5 {
            let result = tokio::time::timeout(
                Duration::from_millis(20),
                store.increment("k", Duration::from_secs(1)),
            )
            .await;
            assert!(result.is_err());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let store = RedisCounterStore::new(RedisStoreConfig {
            url: "redis://127.0.0.1:1/".to_string(),
        })
        .unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(30),
            store.increment("k", Duration::from_secs(1)),
        )
        .await
        .expect("connection attempts should give up");
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
