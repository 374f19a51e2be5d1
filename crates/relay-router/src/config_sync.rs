//! Configuration sync service
//!
//! Re-reads the configuration file on an interval and applies the router
//! topology through `QueueManager::reconcile` when it changed. The full
//! config is hashed on its router-relevant subset so formatting-only edits
//! are ignored.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use relay_common::{RouterTopology, WarningKind, WarningSeverity};
use relay_config::AppConfig;

use crate::manager::QueueManager;
use crate::warning::WarningService;

#[derive(Debug, Clone)]
pub struct ConfigSyncConfig {
    pub enabled: bool,
    /// Config file to watch
    pub path: PathBuf,
    /// How often to re-read the file
    pub sync_interval: Duration,
}

impl ConfigSyncConfig {
    pub fn new(path: PathBuf, sync_interval: Duration) -> Self {
        Self {
            enabled: !sync_interval.is_zero(),
            path,
            sync_interval,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigSyncResult {
    pub success: bool,
    pub changed: bool,
    pub error: Option<String>,
}

/// Watches the config file and drives incremental reconcile.
pub struct ConfigSyncService {
    config: ConfigSyncConfig,
    manager: Arc<QueueManager>,
    warning_service: Arc<WarningService>,
    last_hash: parking_lot::Mutex<Option<u64>>,
}

impl ConfigSyncService {
    pub fn new(
        config: ConfigSyncConfig,
        manager: Arc<QueueManager>,
        warning_service: Arc<WarningService>,
    ) -> Self {
        Self {
            config,
            manager,
            warning_service,
            last_hash: parking_lot::Mutex::new(None),
        }
    }

    fn compute_topology_hash(topology: &RouterTopology) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();

        for pool in &topology.pools {
            pool.code.hash(&mut hasher);
            pool.concurrency.hash(&mut hasher);
            pool.queue_capacity.hash(&mut hasher);
            pool.rate_limit_per_minute.hash(&mut hasher);
        }

        for queue in &topology.queues {
            queue.identifier().hash(&mut hasher);
            queue.uri.hash(&mut hasher);
            queue.connections.hash(&mut hasher);
        }

        hasher.finish()
    }

    fn load_topology(&self) -> Result<RouterTopology, String> {
        let config = AppConfig::from_file(&self.config.path)
            .map_err(|e| format!("Failed to load config file: {}", e))?;
        Ok(config.topology())
    }

    /// Apply the current topology unconditionally (initial setup). Returns
    /// it so the caller can log or inspect.
    pub async fn initial_sync(&self) -> Result<RouterTopology, String> {
        let topology = self.load_topology()?;

        self.manager
            .reconcile(&topology)
            .await
            .map_err(|e| format!("Failed to apply config: {}", e))?;

        *self.last_hash.lock() = Some(Self::compute_topology_hash(&topology));

        info!(
            pools = topology.pools.len(),
            queues = topology.queues.len(),
            "Initial configuration applied"
        );

        Ok(topology)
    }

    /// Re-read the file, reconcile on change.
    pub async fn sync(&self) -> ConfigSyncResult {
        let topology = match self.load_topology() {
            Ok(topology) => topology,
            Err(e) => {
                self.warning_service.add_warning(
                    WarningKind::Configuration,
                    WarningSeverity::Error,
                    format!("Config sync failed: {}", e),
                    "ConfigSyncService".to_string(),
                );
                return ConfigSyncResult {
                    success: false,
                    changed: false,
                    error: Some(e),
                };
            }
        };

        let new_hash = Self::compute_topology_hash(&topology);
        let changed = {
            let last_hash = self.last_hash.lock();
            Some(new_hash) != *last_hash
        };

        if !changed {
            debug!("Configuration unchanged, skipping reconcile");
            return ConfigSyncResult {
                success: true,
                changed: false,
                error: None,
            };
        }

        info!(
            pools = topology.pools.len(),
            queues = topology.queues.len(),
            "Configuration changed, reconciling"
        );

        match self.manager.reconcile(&topology).await {
            Ok(()) => {
                *self.last_hash.lock() = Some(new_hash);
                ConfigSyncResult {
                    success: true,
                    changed: true,
                    error: None,
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to apply configuration");
                self.warning_service.add_warning(
                    WarningKind::Configuration,
                    WarningSeverity::Error,
                    format!("Config reconcile failed: {}", e),
                    "ConfigSyncService".to_string(),
                );
                ConfigSyncResult {
                    success: false,
                    changed: true,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    pub fn sync_interval(&self) -> Duration {
        self.config.sync_interval
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

/// Spawn the periodic sync task.
pub fn spawn_config_sync_task(
    config_sync: Arc<ConfigSyncService>,
    shutdown_tx: broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let interval = config_sync.sync_interval();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        // Initial sync already ran; skip the immediate tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = config_sync.sync().await;
                    if !result.success {
                        warn!(
                            error = ?result.error,
                            "Scheduled config sync failed - keeping existing config"
                        );
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Config sync task shutting down");
                    break;
                }
            }
        }
    })
}
