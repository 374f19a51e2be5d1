//! Lifecycle manager - background tasks for the message router
//!
//! - Draining-pool cleanup
//! - Queue metrics polling
//! - Warning service cleanup
//! - Health report logging
//!
//! All tasks hang off one shutdown broadcast.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::health::HealthService;
use crate::manager::QueueManager;
use crate::router_metrics;
use crate::warning::WarningService;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Interval for reaping drained pools
    pub draining_pool_cleanup_interval: Duration,
    /// Interval for broker depth polling
    pub metrics_poll_interval: Duration,
    /// Interval for warning service cleanup
    pub warning_cleanup_interval: Duration,
    /// Interval for health report logging
    pub health_report_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            draining_pool_cleanup_interval: Duration::from_secs(10),
            metrics_poll_interval: Duration::from_secs(5),
            warning_cleanup_interval: Duration::from_secs(300),
            health_report_interval: Duration::from_secs(60),
        }
    }
}

/// Owns the background task set.
pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
}

impl LifecycleManager {
    /// Start all background tasks.
    pub fn start(
        manager: Arc<QueueManager>,
        warning_service: Arc<WarningService>,
        health_service: Arc<HealthService>,
        config: LifecycleConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Draining pool reaper
        {
            let manager = manager.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.draining_pool_cleanup_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            manager.cleanup_draining_pools().await;
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Draining-pool reaper shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Queue depth poller
        {
            let manager = manager.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.metrics_poll_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            for metrics in manager.get_queue_metrics().await {
                                router_metrics::set_queue_pending(
                                    &metrics.queue_identifier,
                                    metrics.pending_messages,
                                );
                                router_metrics::set_queue_in_flight(
                                    &metrics.queue_identifier,
                                    metrics.in_flight_messages,
                                );
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Queue metrics poller shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Warning cleanup
        {
            let warning_service = warning_service.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.warning_cleanup_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            debug!("Running warning cleanup");
                            warning_service.cleanup();
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Warning cleanup task shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Health report logger
        {
            let manager = manager.clone();
            let health_service = health_service.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.health_report_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let pool_stats = manager.get_pool_stats();
                            let consumer_health = manager.consumer_health().await;
                            let report =
                                health_service.get_health_report(&pool_stats, &consumer_health);

                            if report.issues.is_empty() {
                                debug!(status = ?report.status, "Health report: OK");
                            } else {
                                warn!(
                                    status = ?report.status,
                                    issues = ?report.issues,
                                    "Health report"
                                );
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Health report logger shutting down");
                            break;
                        }
                    }
                }
            });
        }

        info!("Lifecycle manager started");

        Self { shutdown_tx }
    }

    /// Signal all background tasks to stop.
    pub fn shutdown(&self) {
        info!("Lifecycle manager shutting down");
        let _ = self.shutdown_tx.send(());
    }

    /// For spawning extra tasks tied to the same shutdown signal.
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = LifecycleConfig::default();
        assert_eq!(config.metrics_poll_interval, Duration::from_secs(5));
        assert_eq!(config.warning_cleanup_interval, Duration::from_secs(300));
    }
}
