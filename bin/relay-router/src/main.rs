//! Relay message router
//!
//! Consumes pointers from the configured broker queues and routes them
//! through the processing pipeline to their mediation targets.
//!
//! - Incremental configuration reconcile: the config file is re-read on an
//!   interval and pool/queue changes are applied without restart.
//! - Active/standby HA: with `[standby] enabled = true` only the instance
//!   holding the Redis leader lock processes messages.
//! - Prometheus metrics: set `[router] metrics_port` to expose an exporter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use relay_common::{QueueSettings, QueueType};
use relay_config::{ConfigLoader, SqsClientConfig};
use relay_queue::activemq::{AmqpBrokerQueue, AmqpConfig};
use relay_queue::sqlite::SqliteBrokerQueue;
use relay_queue::sqs::SqsBrokerQueue;
use relay_queue::BrokerQueue;
use relay_router::{
    spawn_config_sync_task, ConfigSyncConfig, ConfigSyncService, ConsumerFactory,
    ConsumerSettings, HealthService, HealthServiceConfig, HttpMediator, LifecycleConfig,
    LifecycleManager, MessageRouter, QueueConsumer, QueueManager, RouterError, StandbyService,
    WarningService, WarningServiceConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    relay_common::logging::init_logging("relay-router");

    info!("Starting relay message router");

    let loader = ConfigLoader::new();
    let config = loader.load().context("Failed to load configuration")?;
    let config_path = loader.find_config_file();

    if config.router.metrics_port > 0 {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], config.router.metrics_port))
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(port = config.router.metrics_port, "Prometheus exporter listening");
    }

    let warning_service = Arc::new(WarningService::new(WarningServiceConfig::default()));
    let health_service = Arc::new(HealthService::new(
        HealthServiceConfig::default(),
        warning_service.clone(),
    ));

    let mediator = Arc::new(HttpMediator::new());

    let mut manager = QueueManager::with_limits(
        mediator,
        warning_service.clone(),
        config.router.max_pools,
        config.router.pool_warning_threshold,
    );
    manager.set_drain_timeout(Duration::from_secs(config.router.drain_timeout_seconds));
    let manager = Arc::new(manager);

    let factory = Arc::new(BrokerConsumerFactory {
        sqs: config.sqs.clone(),
        data_dir: config.data_dir.clone(),
    });
    manager.set_consumer_factory(factory).await;

    // Apply the initial topology: pools and consumers are created now, but
    // stay quiescent until the standby service promotes this instance.
    let config_sync = config_path.as_ref().map(|path| {
        Arc::new(ConfigSyncService::new(
            ConfigSyncConfig::new(
                path.clone(),
                Duration::from_secs(config.router.config_sync_interval_seconds),
            ),
            manager.clone(),
            warning_service.clone(),
        ))
    });

    match &config_sync {
        Some(sync) => {
            sync.initial_sync()
                .await
                .map_err(|e| anyhow::anyhow!(e))
                .context("Initial configuration apply failed")?;
        }
        None => {
            let topology = config.topology();
            info!(
                pools = topology.pools.len(),
                queues = topology.queues.len(),
                "No config file found - applying built-in defaults"
            );
            manager
                .reconcile(&topology)
                .await
                .context("Initial configuration apply failed")?;
        }
    }

    // Leadership gate: starts consumers and pools on promotion.
    let standby = StandbyService::from_settings(
        &config.standby,
        &config.redis.url,
        manager.clone(),
    )
    .await
    .context("Failed to initialize standby service")?;
    standby.start().await;

    let lifecycle = LifecycleManager::start(
        manager.clone(),
        warning_service.clone(),
        health_service.clone(),
        LifecycleConfig {
            metrics_poll_interval: Duration::from_secs(
                config.router.metrics_poll_interval_seconds.max(1),
            ),
            ..Default::default()
        },
    );

    if let Some(sync) = &config_sync {
        if sync.is_enabled() {
            spawn_config_sync_task(sync.clone(), lifecycle.shutdown_sender());
        }
    }

    info!(
        standby_enabled = config.standby.enabled,
        pools = manager.pool_codes().len(),
        "Relay router up"
    );

    signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    // Step down first so the peer can take over, then drain.
    standby.shutdown().await;
    lifecycle.shutdown();
    manager.shutdown().await;

    info!("Relay router stopped");
    Ok(())
}

/// Builds broker handles and consumer drivers from queue settings.
struct BrokerConsumerFactory {
    sqs: SqsClientConfig,
    data_dir: String,
}

impl BrokerConsumerFactory {
    async fn sqs_client(&self) -> aws_sdk_sqs::Client {
        let mut builder = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if !self.sqs.region.is_empty() {
            builder = builder.region(aws_config::Region::new(self.sqs.region.clone()));
        }
        if !self.sqs.endpoint_url.is_empty() {
            info!(endpoint = %self.sqs.endpoint_url, "Using custom SQS endpoint");
            builder = builder.endpoint_url(&self.sqs.endpoint_url);
        }
        aws_sdk_sqs::Client::new(&builder.load().await)
    }

    async fn embedded_pool(&self) -> relay_router::Result<sqlx::Pool<sqlx::Sqlite>> {
        std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| RouterError::Config(format!("Cannot create data dir: {}", e)))?;

        sqlx::sqlite::SqlitePoolOptions::new()
            .connect(&format!("sqlite://{}/queue.db?mode=rwc", self.data_dir))
            .await
            .map_err(|e| RouterError::Queue(format!("SQLite connect failed: {}", e)))
    }
}

#[async_trait]
impl ConsumerFactory for BrokerConsumerFactory {
    async fn create_consumer(
        &self,
        settings: &QueueSettings,
        router: Arc<dyn MessageRouter>,
        warnings: Arc<WarningService>,
    ) -> relay_router::Result<Arc<QueueConsumer>> {
        let broker: Arc<dyn BrokerQueue> = match settings.queue_type {
            QueueType::Sqs => {
                let client = self.sqs_client().await;
                Arc::new(SqsBrokerQueue::from_queue_url(
                    client,
                    settings.uri.clone(),
                    settings.visibility_timeout_seconds,
                    settings.wait_time_seconds,
                ))
            }
            QueueType::ActiveMq => {
                let amqp_config = AmqpConfig {
                    uri: settings.uri.clone(),
                    queue_name: settings.identifier().to_string(),
                    receive_timeout: Duration::from_millis(settings.receive_timeout_ms.max(100)),
                    ..Default::default()
                };
                Arc::new(AmqpBrokerQueue::new(amqp_config).await?)
            }
            QueueType::Embedded => {
                let pool = self.embedded_pool().await?;
                let queue = SqliteBrokerQueue::new(
                    pool,
                    settings.identifier().to_string(),
                    settings.visibility_timeout_seconds,
                )
                .with_receive_timeout(Duration::from_millis(settings.receive_timeout_ms.max(100)));
                queue.init_schema().await?;
                Arc::new(queue)
            }
        };

        Ok(QueueConsumer::new(
            broker,
            router,
            warnings,
            ConsumerSettings::from_queue_settings(settings),
        ))
    }
}
