//! Relay configuration
//!
//! TOML-based configuration with environment variable overrides. The
//! `[[pools]]` and `[[queues]]` arrays enumerate the router topology; the
//! rest tunes ambient behavior (standby, metrics, drain windows).

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use relay_common::{PoolConfig, QueueSettings, RouterTopology, StandbySettings};

mod loader;

pub use loader::ConfigLoader;

/// When a pool omits `queue_capacity`, size the buffer from concurrency.
const QUEUE_CAPACITY_MULTIPLIER: u32 = 2;
const MIN_QUEUE_CAPACITY: u32 = 50;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub router: RouterSettings,
    pub standby: StandbySettings,
    pub redis: RedisConfig,
    pub sqs: SqsClientConfig,
    /// Pool definitions; `queue_capacity = 0` derives a default from
    /// concurrency
    pub pools: Vec<PoolEntry>,
    /// Queue definitions
    pub queues: Vec<QueueSettings>,

    /// Data directory for the embedded queue
    pub data_dir: String,

    /// Enable development mode
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            router: RouterSettings::default(),
            standby: StandbySettings::default(),
            redis: RedisConfig::default(),
            sqs: SqsClientConfig::default(),
            pools: Vec::new(),
            queues: Vec::new(),
            data_dir: "./data".to_string(),
            dev_mode: false,
        }
    }
}

/// Router-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Hard cap on the number of pools
    pub max_pools: usize,
    /// Emit a warning when the pool count crosses this threshold
    pub pool_warning_threshold: usize,
    /// How often queue metrics are polled
    pub metrics_poll_interval_seconds: u64,
    /// Bounded drain window for pools on shutdown
    pub drain_timeout_seconds: u64,
    /// Prometheus exporter port; 0 disables the exporter
    pub metrics_port: u16,
    /// Config file re-check interval; 0 disables config sync
    pub config_sync_interval_seconds: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_pools: 2000,
            pool_warning_threshold: 1000,
            metrics_poll_interval_seconds: 5,
            drain_timeout_seconds: 60,
            metrics_port: 0,
            config_sync_interval_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

/// AWS client knobs used when a queue entry selects the SQS type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqsClientConfig {
    pub region: String,
    /// Custom endpoint (e.g. LocalStack); empty for AWS defaults
    pub endpoint_url: String,
}

impl Default for SqsClientConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: String::new(),
        }
    }
}

/// A `[[pools]]` entry; `queue_capacity` and `rate_limit_per_minute` are
/// optional in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEntry {
    pub code: String,
    pub concurrency: u32,
    #[serde(default)]
    pub queue_capacity: Option<u32>,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
}

impl PoolEntry {
    /// Resolve to the runtime pool config, deriving the buffer size when
    /// unset.
    pub fn resolve(&self) -> PoolConfig {
        let queue_capacity = self.queue_capacity.unwrap_or_else(|| {
            std::cmp::max(
                self.concurrency * QUEUE_CAPACITY_MULTIPLIER,
                MIN_QUEUE_CAPACITY,
            )
        });
        PoolConfig {
            code: self.code.clone(),
            concurrency: self.concurrency.max(1),
            queue_capacity: queue_capacity.max(1),
            rate_limit_per_minute: self.rate_limit_per_minute.filter(|r| *r > 0),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with standard search paths and env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for pool in &self.pools {
            if pool.code.is_empty() {
                return Err(ConfigError::ValidationError(
                    "pool code must not be empty".to_string(),
                ));
            }
            if pool.concurrency == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "pool [{}] concurrency must be at least 1",
                    pool.code
                )));
            }
        }
        for queue in &self.queues {
            if queue.identifier().is_empty() {
                return Err(ConfigError::ValidationError(
                    "queue must set a name or uri".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The router-relevant slice: resolved pools plus queues.
    pub fn topology(&self) -> RouterTopology {
        RouterTopology {
            pools: self.pools.iter().map(PoolEntry::resolve).collect(),
            queues: self.queues.clone(),
        }
    }

    /// Example TOML configuration.
    pub fn example_toml() -> String {
        r#"# Relay router configuration
# Environment variables (RELAY_*) override these settings

[router]
max_pools = 2000
pool_warning_threshold = 1000
metrics_poll_interval_seconds = 5
drain_timeout_seconds = 60
metrics_port = 0
config_sync_interval_seconds = 300

[standby]
enabled = false
instance_id = ""
lock_key = "relay:router:leader"
lock_ttl_seconds = 30
refresh_interval_seconds = 10

[redis]
url = "redis://localhost:6379"

[sqs]
region = "us-east-1"
endpoint_url = ""

[[pools]]
code = "DEFAULT-POOL"
concurrency = 20
# queue_capacity = 100
# rate_limit_per_minute = 600

[[queues]]
name = "relay-main"
uri = "relay-main"
queue_type = "EMBEDDED"
connections = 1
visibility_timeout_seconds = 30
receive_timeout_ms = 1000

data_dir = "./data"
dev_mode = false
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::{ConsumerMode, QueueType};

    #[test]
    fn example_config_parses() {
        let config: AppConfig = toml::from_str(&AppConfig::example_toml()).unwrap();
        assert_eq!(config.pools.len(), 1);
        assert_eq!(config.queues.len(), 1);
        assert_eq!(config.queues[0].queue_type, QueueType::Embedded);
        assert_eq!(config.queues[0].consumer_mode, ConsumerMode::Sync);
        config.validate().unwrap();
    }

    #[test]
    fn pool_capacity_defaults_from_concurrency() {
        let entry = PoolEntry {
            code: "P".to_string(),
            concurrency: 100,
            queue_capacity: None,
            rate_limit_per_minute: None,
        };
        assert_eq!(entry.resolve().queue_capacity, 200);

        let small = PoolEntry {
            code: "S".to_string(),
            concurrency: 2,
            queue_capacity: None,
            rate_limit_per_minute: None,
        };
        // Never below the floor
        assert_eq!(small.resolve().queue_capacity, 50);
    }

    #[test]
    fn explicit_capacity_wins() {
        let entry = PoolEntry {
            code: "P".to_string(),
            concurrency: 5,
            queue_capacity: Some(7),
            rate_limit_per_minute: Some(0),
        };
        let resolved = entry.resolve();
        assert_eq!(resolved.queue_capacity, 7);
        // A zero rate means no limiting
        assert_eq!(resolved.rate_limit_per_minute, None);
    }

    #[test]
    fn validation_rejects_zero_concurrency() {
        let config = AppConfig {
            pools: vec![PoolEntry {
                code: "P".to_string(),
                concurrency: 0,
                queue_capacity: None,
                rate_limit_per_minute: None,
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
