//! Redis leader lock
//!
//! - SET NX with expiry for atomic acquisition
//! - Lua check-and-extend so only the holder can renew
//! - Lua check-and-delete so only the holder can release

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, StandbyError};

/// Configuration for the Redis leader lock.
#[derive(Debug, Clone)]
pub struct LeaderLockConfig {
    pub redis_url: String,
    pub lock_key: String,
    pub lock_ttl_seconds: u64,
    /// Unique identifier for this instance; generated when empty
    pub instance_id: String,
}

impl Default for LeaderLockConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            lock_key: "relay:router:leader".to_string(),
            lock_ttl_seconds: 30,
            instance_id: Uuid::new_v4().to_string(),
        }
    }
}

impl LeaderLockConfig {
    pub fn new(redis_url: String) -> Self {
        Self {
            redis_url,
            ..Default::default()
        }
    }

    pub fn with_lock_key(mut self, key: String) -> Self {
        self.lock_key = key;
        self
    }

    pub fn with_ttl_seconds(mut self, ttl: u64) -> Self {
        self.lock_ttl_seconds = ttl;
        self
    }

    pub fn with_instance_id(mut self, id: String) -> Self {
        if !id.is_empty() {
            self.instance_id = id;
        }
        self
    }
}

/// A distributed single-holder lock.
#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// This instance's holder id.
    fn holder_id(&self) -> &str;

    /// Attempt acquisition without waiting. Returns whether this instance
    /// now holds the lock.
    async fn try_acquire(&self) -> Result<bool>;

    /// Extend the lease. Returns false when ownership was lost.
    async fn renew(&self) -> Result<bool>;

    /// Release the lock if this instance holds it.
    async fn release(&self) -> Result<()>;
}

/// Redis implementation of [`LeaderLock`].
pub struct RedisLeaderLock {
    config: LeaderLockConfig,
    conn: ConnectionManager,
}

impl RedisLeaderLock {
    pub async fn new(config: LeaderLockConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| StandbyError::Connection(e.to_string()))?;

        let conn = ConnectionManager::new(client).await?;

        Ok(Self { config, conn })
    }

    pub fn lock_key(&self) -> &str {
        &self.config.lock_key
    }
}

#[async_trait]
impl LeaderLock for RedisLeaderLock {
    fn holder_id(&self) -> &str {
        &self.config.instance_id
    }

    async fn try_acquire(&self) -> Result<bool> {
        let mut conn = self.conn.clone();

        // SET key value NX EX seconds
        let result: Option<String> = redis::cmd("SET")
            .arg(&self.config.lock_key)
            .arg(&self.config.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(self.config.lock_ttl_seconds)
            .query_async(&mut conn)
            .await?;

        let acquired = result.is_some();
        if acquired {
            info!(
                instance_id = %self.config.instance_id,
                lock_key = %self.config.lock_key,
                "Acquired leader lock"
            );
        }
        Ok(acquired)
    }

    async fn renew(&self) -> Result<bool> {
        let mut conn = self.conn.clone();

        let script = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                redis.call("EXPIRE", KEYS[1], ARGV[2])
                return 1
            else
                return 0
            end
        "#;

        let result: i32 = redis::Script::new(script)
            .key(&self.config.lock_key)
            .arg(&self.config.instance_id)
            .arg(self.config.lock_ttl_seconds)
            .invoke_async(&mut conn)
            .await?;

        let renewed = result == 1;
        if renewed {
            debug!(instance_id = %self.config.instance_id, "Renewed leader lock");
        }
        Ok(renewed)
    }

    async fn release(&self) -> Result<()> {
        let mut conn = self.conn.clone();

        let script = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                redis.call("DEL", KEYS[1])
                return 1
            else
                return 0
            end
        "#;

        let result: i32 = redis::Script::new(script)
            .key(&self.config.lock_key)
            .arg(&self.config.instance_id)
            .invoke_async(&mut conn)
            .await?;

        if result == 1 {
            info!(instance_id = %self.config.instance_id, "Released leader lock");
        } else {
            debug!(
                instance_id = %self.config.instance_id,
                "Leader lock was not held at release"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = LeaderLockConfig::default();
        assert_eq!(config.lock_ttl_seconds, 30);
        assert_eq!(config.lock_key, "relay:router:leader");
        assert!(!config.instance_id.is_empty());
    }

    #[test]
    fn config_builder() {
        let config = LeaderLockConfig::new("redis://localhost:6380".to_string())
            .with_lock_key("custom:lock".to_string())
            .with_ttl_seconds(15)
            .with_instance_id("node-1".to_string());

        assert_eq!(config.redis_url, "redis://localhost:6380");
        assert_eq!(config.lock_key, "custom:lock");
        assert_eq!(config.lock_ttl_seconds, 15);
        assert_eq!(config.instance_id, "node-1");
    }

    #[test]
    fn empty_instance_id_keeps_generated() {
        let config = LeaderLockConfig::default().with_instance_id(String::new());
        assert!(!config.instance_id.is_empty());
    }
}
