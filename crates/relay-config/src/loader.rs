//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "relay.toml",
    "./config/config.toml",
    "./config/relay.toml",
    "/etc/relay/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with env overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// The config file currently in effect, if any.
    pub fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("RELAY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Router
        if let Ok(val) = env::var("RELAY_ROUTER_MAX_POOLS") {
            if let Ok(pools) = val.parse() {
                config.router.max_pools = pools;
            }
        }
        if let Ok(val) = env::var("RELAY_ROUTER_POOL_WARNING_THRESHOLD") {
            if let Ok(threshold) = val.parse() {
                config.router.pool_warning_threshold = threshold;
            }
        }
        if let Ok(val) = env::var("RELAY_METRICS_POLL_INTERVAL_SECONDS") {
            if let Ok(interval) = val.parse() {
                config.router.metrics_poll_interval_seconds = interval;
            }
        }
        if let Ok(val) = env::var("RELAY_DRAIN_TIMEOUT_SECONDS") {
            if let Ok(timeout) = val.parse() {
                config.router.drain_timeout_seconds = timeout;
            }
        }
        if let Ok(val) = env::var("RELAY_METRICS_PORT") {
            if let Ok(port) = val.parse() {
                config.router.metrics_port = port;
            }
        }
        if let Ok(val) = env::var("RELAY_CONFIG_SYNC_INTERVAL_SECONDS") {
            if let Ok(interval) = val.parse() {
                config.router.config_sync_interval_seconds = interval;
            }
        }

        // Standby
        if let Ok(val) = env::var("RELAY_STANDBY_ENABLED") {
            config.standby.enabled = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var("RELAY_STANDBY_INSTANCE_ID") {
            config.standby.instance_id = val;
        }
        if let Ok(val) = env::var("RELAY_STANDBY_LOCK_KEY") {
            config.standby.lock_key = val;
        }
        if let Ok(val) = env::var("RELAY_STANDBY_LOCK_TTL_SECONDS") {
            if let Ok(ttl) = val.parse() {
                config.standby.lock_ttl_seconds = ttl;
            }
        }
        if let Ok(val) = env::var("RELAY_STANDBY_REFRESH_INTERVAL_SECONDS") {
            if let Ok(interval) = val.parse() {
                config.standby.refresh_interval_seconds = interval;
            }
        }

        // Redis
        if let Ok(val) = env::var("RELAY_REDIS_URL") {
            config.redis.url = val;
        }

        // SQS client
        if let Ok(val) = env::var("RELAY_SQS_REGION") {
            config.sqs.region = val;
        }
        if let Ok(val) = env::var("RELAY_SQS_ENDPOINT_URL") {
            config.sqs.endpoint_url = val;
        }

        // General
        if let Ok(val) = env::var("RELAY_DATA_DIR") {
            config.data_dir = val;
        }
        if let Ok(val) = env::var("RELAY_DEV_MODE") {
            config.dev_mode = val.parse().unwrap_or(false);
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_from_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            dev_mode = true

            [[pools]]
            code = "P1"
            concurrency = 4
            "#
        )
        .unwrap();

        let config = ConfigLoader::with_path(file.path()).load().unwrap();
        assert!(config.dev_mode);
        assert_eq!(config.pools.len(), 1);
        assert_eq!(config.topology().pools[0].code, "P1");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = ConfigLoader::with_path("/nonexistent/relay.toml")
            .load()
            .unwrap();
        assert_eq!(config.router.max_pools, 2000);
        assert!(config.pools.is_empty());
    }
}
