//! Configuration management for Taskgate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, TaskgateError};
use crate::identity::AnonymousPolicy;
use crate::ratelimit::{FailureMode, PolicyRegistry, PolicyRule, DEFAULT_KEY_PREFIX};

/// Operation id of the task creation route.
pub const OP_TASKS_CREATE: &str = "tasks.create";
/// Operation id of the task listing route.
pub const OP_TASKS_LIST: &str = "tasks.list";
/// Operation id of the single task read route.
pub const OP_TASKS_READ: &str = "tasks.read";
/// Operation id of the task update route.
pub const OP_TASKS_UPDATE: &str = "tasks.update";
/// Operation id of the task delete route.
pub const OP_TASKS_DELETE: &str = "tasks.delete";

/// Main configuration for the Taskgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared counter store configuration
    #[serde(default)]
    pub counter_store: CounterStoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Task persistence configuration
    #[serde(default)]
    pub task_store: TaskStoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8000))
}

/// Which counter store backs admission decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis instance; consistent across processes
    #[default]
    Redis,
    /// Process-local map; only consistent within one process
    Memory,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterStoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Deadline for one store round trip in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,

    /// Namespace for counter keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for CounterStoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            timeout_ms: default_store_timeout_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl CounterStoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6380/".to_string()
}

fn default_store_timeout_ms() -> u64 {
    50
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Where tasks are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskBackend {
    /// SQLite database; survives restarts
    #[default]
    Sqlite,
    /// Process-local map; lost on restart
    Memory,
}

/// Task store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStoreConfig {
    #[serde(default)]
    pub backend: TaskBackend,

    /// SQLite database URL
    #[serde(default = "default_task_db_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_task_db_connections")]
    pub max_connections: u32,
}

impl Default for TaskStoreConfig {
    fn default() -> Self {
        Self {
            backend: TaskBackend::default(),
            url: default_task_db_url(),
            max_connections: default_task_db_connections(),
        }
    }
}

fn default_task_db_url() -> String {
    "sqlite://todo.db".to_string()
}

fn default_task_db_connections() -> u32 {
    5
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Behavior when the counter store is unreachable
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Request header carrying the caller identity
    #[serde(default = "default_identity_header")]
    pub identity_header: String,

    /// Handling of requests without an identity
    #[serde(default)]
    pub anonymous: AnonymousPolicy,

    /// Operation id -> policy
    #[serde(default = "default_policies")]
    pub policies: BTreeMap<String, PolicyRule>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::default(),
            identity_header: default_identity_header(),
            anonymous: AnonymousPolicy::default(),
            policies: default_policies(),
        }
    }
}

fn default_identity_header() -> String {
    "x-user-id".to_string()
}

/// Task creation is limited to 5 requests every 10 seconds per user.
fn default_policies() -> BTreeMap<String, PolicyRule> {
    let mut policies = BTreeMap::new();
    policies.insert(OP_TASKS_CREATE.to_string(), PolicyRule::new(5, 10));
    policies
}

impl RateLimitingConfig {
    /// Validate every configured policy and build the lookup table.
    pub fn policy_registry(&self) -> Result<PolicyRegistry> {
        PolicyRegistry::from_rules(&self.policies)
    }
}

impl TaskgateConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| TaskgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.counter_store.timeout_ms == 0 {
            return Err(TaskgateError::Config(
                "counter_store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TaskgateConfig::default();
        assert_eq!(config.server.http_addr.port(), 8000);
        assert_eq!(config.counter_store.backend, StoreBackend::Redis);
        assert_eq!(config.counter_store.timeout(), Duration::from_millis(50));
        assert_eq!(config.rate_limiting.failure_mode, FailureMode::FailOpen);
        assert_eq!(config.rate_limiting.anonymous, AnonymousPolicy::Reject);

        let registry = config.rate_limiting.policy_registry().unwrap();
        let create = registry.get(OP_TASKS_CREATE).unwrap();
        assert_eq!(create.max_requests(), 5);
        assert_eq!(create.window_seconds(), 10);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server:
  http_addr: 0.0.0.0:9000
counter_store:
  backend: memory
  timeout_ms: 25
  key_prefix: "app:"
rate_limiting:
  failure_mode: fail_closed
  identity_header: x-caller
  anonymous:
    mode: shared_bucket
    identity: anonymous
  policies:
    tasks.create:
      max_requests: 10
      window_seconds: 60
    tasks.delete:
      max_requests: 1
      window_seconds: 1
"#;
        let config = TaskgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(config.counter_store.backend, StoreBackend::Memory);
        assert_eq!(config.counter_store.key_prefix, "app:");
        assert_eq!(config.counter_store.url, "redis://127.0.0.1:6380/");
        assert_eq!(config.rate_limiting.failure_mode, FailureMode::FailClosed);
        assert_eq!(
            config.rate_limiting.anonymous,
            AnonymousPolicy::SharedBucket {
                identity: "anonymous".to_string()
            }
        );
        assert_eq!(config.rate_limiting.policy_registry().unwrap().len(), 2);
    }

    #[test]
    fn test_explicit_empty_policy_table() {
        let config = TaskgateConfig::from_yaml("rate_limiting:\n  policies: {}\n").unwrap();
        assert!(config.rate_limiting.policy_registry().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_policy_fails_registry() {
        let yaml = r#"
rate_limiting:
  policies:
    tasks.create:
      max_requests: -3
      window_seconds: 10
"#;
        let config = TaskgateConfig::from_yaml(yaml).unwrap();
        let err = config.rate_limiting.policy_registry().unwrap_err();
        assert!(matches!(err, TaskgateError::InvalidPolicy { .. }));
    }

    #[test]
    fn test_zero_store_timeout_rejected() {
        let err = TaskgateConfig::from_yaml("counter_store:\n  timeout_ms: 0\n").unwrap_err();
        match err {
            TaskgateError::Config(msg) => assert!(msg.contains("timeout_ms")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(TaskgateConfig::default().validate().is_ok());
    }

    #[test]
    fn test_task_store_section() {
        let config = TaskgateConfig::default();
        assert_eq!(config.task_store.backend, TaskBackend::Sqlite);
        assert_eq!(config.task_store.url, "sqlite://todo.db");

        let yaml = "task_store:\n  backend: memory\n";
        let config = TaskgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.task_store.backend, TaskBackend::Memory);
        assert_eq!(config.task_store.max_connections, 5);
    }

    #[test]
    fn test_malformed_yaml_is_config_error() {
        let err = TaskgateConfig::from_yaml("server: [").unwrap_err();
        assert!(matches!(err, TaskgateError::Config(_)));
    }
}
