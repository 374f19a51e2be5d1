//! Standby service - primary/standby gating for the whole router
//!
//! Maintains `is_primary` against a distributed leader lock. Transitions
//! drive a [`StandbyListener`]: becoming primary starts consumers and pool
//! workers, becoming standby makes the router fully quiescent. With standby
//! disabled the instance is always primary (single-instance mode).

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use relay_standby::{LeaderLock, LeaderLockConfig, RedisLeaderLock};

use relay_common::StandbySettings;

/// `Starting -> Standby <-> Primary -> Stopping -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandbyState {
    Starting,
    Standby,
    Primary,
    Stopping,
    Stopped,
}

/// Receives leadership transitions.
#[async_trait]
pub trait StandbyListener: Send + Sync {
    async fn on_become_primary(&self);
    async fn on_become_standby(&self);
}

/// Drives acquisition and renewal of the leader lock.
pub struct StandbyService {
    /// None in single-instance mode
    lock: Option<Arc<dyn LeaderLock>>,
    listener: Arc<dyn StandbyListener>,
    refresh_interval: Duration,
    is_primary: AtomicBool,
    running: AtomicBool,
    state_tx: watch::Sender<StandbyState>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl StandbyService {
    /// Standby enabled: gate on the given lock.
    pub fn new(
        lock: Arc<dyn LeaderLock>,
        listener: Arc<dyn StandbyListener>,
        refresh_interval: Duration,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(StandbyState::Starting);
        Arc::new(Self {
            lock: Some(lock),
            listener,
            refresh_interval,
            is_primary: AtomicBool::new(false),
            running: AtomicBool::new(false),
            state_tx,
            task: parking_lot::Mutex::new(None),
        })
    }

    /// Standby disabled: always primary.
    pub fn disabled(listener: Arc<dyn StandbyListener>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(StandbyState::Starting);
        Arc::new(Self {
            lock: None,
            listener,
            refresh_interval: Duration::from_secs(10),
            is_primary: AtomicBool::new(false),
            running: AtomicBool::new(false),
            state_tx,
            task: parking_lot::Mutex::new(None),
        })
    }

    /// Build from settings, connecting a Redis lock when enabled.
    pub async fn from_settings(
        settings: &StandbySettings,
        redis_url: &str,
        listener: Arc<dyn StandbyListener>,
    ) -> relay_standby::Result<Arc<Self>> {
        if !settings.enabled {
            info!("Standby disabled - this instance is always primary");
            return Ok(Self::disabled(listener));
        }

        let lock_config = LeaderLockConfig::new(redis_url.to_string())
            .with_lock_key(settings.lock_key.clone())
            .with_ttl_seconds(settings.lock_ttl_seconds)
            .with_instance_id(settings.instance_id.clone());
        let lock = Arc::new(RedisLeaderLock::new(lock_config).await?);

        Ok(Self::new(
            lock,
            listener,
            Duration::from_secs(settings.refresh_interval_seconds.max(1)),
        ))
    }

    /// Attempt initial acquisition and start the refresh loop.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(lock) = self.lock.clone() else {
            // Single-instance mode
            self.become_primary().await;
            return;
        };

        info!(
            instance_id = %lock.holder_id(),
            refresh_interval_secs = self.refresh_interval.as_secs(),
            "Starting standby service"
        );

        match lock.try_acquire().await {
            Ok(true) => self.become_primary().await,
            Ok(false) => self.become_standby().await,
            Err(e) => {
                error!(error = %e, "Initial lock acquisition failed, starting in standby");
                self.become_standby().await;
            }
        }

        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            service.run_refresh_loop(lock).await;
        });
        *self.task.lock() = Some(handle);
    }

    /// Renew while primary; keep retrying acquisition while standby.
    async fn run_refresh_loop(self: Arc<Self>, lock: Arc<dyn LeaderLock>) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.tick().await; // immediate first tick

        loop {
            ticker.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            if self.is_primary() {
                match lock.renew().await {
                    Ok(true) => {
                        debug!(instance_id = %lock.holder_id(), "Leader lease renewed");
                    }
                    Ok(false) => {
                        warn!(instance_id = %lock.holder_id(), "Leader lock lost");
                        self.become_standby().await;
                    }
                    Err(e) => {
                        // Renewal must not silently keep a possibly-expired
                        // lease: treat any failure as loss of leadership
                        error!(error = %e, "Lease renewal failed, stepping down");
                        self.become_standby().await;
                    }
                }
            } else {
                match lock.try_acquire().await {
                    Ok(true) => {
                        info!(instance_id = %lock.holder_id(), "Leader lock acquired");
                        self.become_primary().await;
                    }
                    Ok(false) => {
                        debug!(instance_id = %lock.holder_id(), "Leader lock held elsewhere");
                    }
                    Err(e) => {
                        warn!(error = %e, "Lock acquisition attempt failed");
                    }
                }
            }
        }
    }

    async fn become_primary(&self) {
        if self.is_primary.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.state_tx.send(StandbyState::Primary);
        info!("Instance is PRIMARY - starting message processing");
        self.listener.on_become_primary().await;
    }

    async fn become_standby(&self) {
        let was_primary = self.is_primary.swap(false, Ordering::SeqCst);
        let _ = self.state_tx.send(StandbyState::Standby);
        if was_primary {
            warn!("Instance is STANDBY - pausing message processing");
            self.listener.on_become_standby().await;
        }
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> StandbyState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<StandbyState> {
        self.state_tx.subscribe()
    }

    pub fn is_standby_enabled(&self) -> bool {
        self.lock.is_some()
    }

    /// Graceful shutdown: step down, release the lock, stop the loop.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.state_tx.send(StandbyState::Stopping);
        info!("Standby service stopping");

        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }

        if self.is_primary.swap(false, Ordering::SeqCst) {
            self.listener.on_become_standby().await;
        }

        if let Some(lock) = &self.lock {
            if let Err(e) = lock.release().await {
                warn!(error = %e, "Failed to release leader lock");
            }
        }

        let _ = self.state_tx.send(StandbyState::Stopped);
    }
}
