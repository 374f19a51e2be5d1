//! QueueManager - global fan-in and pool registry
//!
//! Owns the in-pipeline registry, the pool registry and the consumer
//! registry. Consumers only ever see the one-method [`MessageRouter`] view,
//! keeping the object graph a DAG.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use relay_common::{
    MessageCallback, MessagePointer, PoolConfig, PoolStats, QueueSettings, RouterTopology,
    WarningKind, WarningSeverity,
};
use relay_queue::QueueMetrics;

use crate::consumer::QueueConsumer;
use crate::mediator::Mediator;
use crate::pipeline::PipelineRegistry;
use crate::pool::{ProcessPool, DEFAULT_DRAIN_TIMEOUT};
use crate::rate_limit::RateLimiterRegistry;
use crate::warning::WarningService;
use crate::{Result, RouterError};

/// Per-request deadline for broker metrics queries.
const METRICS_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// The single admission method consumers hold a reference to.
#[async_trait]
pub trait MessageRouter: Send + Sync {
    /// Admit one pointer with its completion callback. Returns false when
    /// the pointer was refused (unknown pool, duplicate, buffer full); a
    /// refused pointer must be left unacked so the broker redelivers it.
    async fn route(&self, pointer: MessagePointer, callback: Arc<dyn MessageCallback>) -> bool;
}

/// Creates queue consumers during initial setup and reconcile.
#[async_trait]
pub trait ConsumerFactory: Send + Sync {
    async fn create_consumer(
        &self,
        settings: &QueueSettings,
        router: Arc<dyn MessageRouter>,
        warnings: Arc<WarningService>,
    ) -> Result<Arc<QueueConsumer>>;
}

/// Central orchestrator: pool registry, consumer registry, dedup pipeline.
pub struct QueueManager {
    pipeline: Arc<PipelineRegistry>,
    limiters: Arc<RateLimiterRegistry>,

    pools: DashMap<String, Arc<ProcessPool>>,

    /// Pools removed from config, still finishing in-flight work; keyed by
    /// a sequence so repeated replacements of one code never collide
    draining_pools: DashMap<String, Arc<ProcessPool>>,
    draining_seq: std::sync::atomic::AtomicU64,

    consumers: RwLock<HashMap<String, Arc<QueueConsumer>>>,

    /// Current configs, for diffing during reconcile
    pool_configs: RwLock<HashMap<String, PoolConfig>>,
    queue_configs: RwLock<HashMap<String, QueueSettings>>,

    consumer_factory: RwLock<Option<Arc<dyn ConsumerFactory>>>,

    mediator: Arc<dyn Mediator>,
    warning_service: Arc<WarningService>,

    /// Whether this instance currently processes messages (primary)
    active: AtomicBool,
    /// False once shutdown begins
    running: AtomicBool,

    max_pools: usize,
    pool_warning_threshold: usize,
    drain_timeout: Duration,
}

impl QueueManager {
    pub fn new(mediator: Arc<dyn Mediator>, warning_service: Arc<WarningService>) -> Self {
        Self::with_limits(mediator, warning_service, 2000, 1000)
    }

    pub fn with_limits(
        mediator: Arc<dyn Mediator>,
        warning_service: Arc<WarningService>,
        max_pools: usize,
        pool_warning_threshold: usize,
    ) -> Self {
        Self {
            pipeline: Arc::new(PipelineRegistry::new()),
            limiters: Arc::new(RateLimiterRegistry::new()),
            pools: DashMap::new(),
            draining_pools: DashMap::new(),
            draining_seq: std::sync::atomic::AtomicU64::new(0),
            consumers: RwLock::new(HashMap::new()),
            pool_configs: RwLock::new(HashMap::new()),
            queue_configs: RwLock::new(HashMap::new()),
            consumer_factory: RwLock::new(None),
            mediator,
            warning_service,
            active: AtomicBool::new(false),
            running: AtomicBool::new(true),
            max_pools,
            pool_warning_threshold,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn set_drain_timeout(&mut self, drain_timeout: Duration) {
        self.drain_timeout = drain_timeout;
    }

    pub async fn set_consumer_factory(&self, factory: Arc<dyn ConsumerFactory>) {
        *self.consumer_factory.write().await = Some(factory);
    }

    pub fn pipeline(&self) -> &Arc<PipelineRegistry> {
        &self.pipeline
    }

    pub fn warning_service(&self) -> &Arc<WarningService> {
        &self.warning_service
    }

    /// Register an externally constructed consumer (tests, dev wiring).
    pub async fn add_consumer(&self, consumer: Arc<QueueConsumer>) {
        let id = consumer.identifier().to_string();
        self.consumers.write().await.insert(id, consumer);
    }

    // ------------------------------------------------------------------
    // Pool registry
    // ------------------------------------------------------------------

    fn create_pool(&self, config: PoolConfig) -> Result<Arc<ProcessPool>> {
        let current_count = self.pools.len();
        if current_count >= self.max_pools {
            error!(
                pool_code = %config.code,
                current_count = current_count,
                max_pools = self.max_pools,
                "Cannot create pool: limit reached"
            );
            self.warning_service.add_warning(
                WarningKind::PoolLimit,
                WarningSeverity::Critical,
                format!(
                    "Max pool limit reached ({}/{}) - cannot create pool [{}]",
                    current_count, self.max_pools, config.code
                ),
                "QueueManager".to_string(),
            );
            return Err(RouterError::PoolLimitReached(current_count));
        }

        if current_count >= self.pool_warning_threshold {
            warn!(
                pool_code = %config.code,
                current_count = current_count,
                threshold = self.pool_warning_threshold,
                "Pool count approaching limit"
            );
            self.warning_service.add_warning(
                WarningKind::PoolLimit,
                WarningSeverity::Warn,
                format!(
                    "Pool count {} approaching limit {} (threshold: {})",
                    current_count, self.max_pools, self.pool_warning_threshold
                ),
                "QueueManager".to_string(),
            );
        }

        let code = config.code.clone();
        let pool = Arc::new(ProcessPool::new(
            config,
            self.mediator.clone(),
            self.pipeline.clone(),
            self.limiters.clone(),
        ));

        if self.active.load(Ordering::SeqCst) {
            pool.start();
        }

        self.pools.insert(code.clone(), pool.clone());
        info!(pool_code = %code, "Created process pool");
        Ok(pool)
    }

    pub fn pool(&self, code: &str) -> Option<Arc<ProcessPool>> {
        self.pools.get(code).map(|entry| entry.clone())
    }

    pub fn pool_codes(&self) -> Vec<String> {
        self.pools.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn get_pool_stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(|entry| entry.value().stats()).collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.pipeline.len()
    }

    // ------------------------------------------------------------------
    // Configuration reconcile
    // ------------------------------------------------------------------

    /// Apply a topology: compute the add/remove/update diff for pools and
    /// queues and apply it incrementally without a restart.
    pub async fn reconcile(self: &Arc<Self>, topology: &RouterTopology) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            warn!("Reconcile skipped - shutdown in progress");
            return Err(RouterError::ShutdownInProgress);
        }

        let new_pool_configs: HashMap<String, PoolConfig> = topology
            .pools
            .iter()
            .map(|p| (p.code.clone(), p.clone()))
            .collect();

        let mut pool_configs = self.pool_configs.write().await;
        let mut pools_created = 0usize;
        let mut pools_updated = 0usize;
        let mut pools_removed = 0usize;

        // Existing pools: update in place, recreate on size change, or drain
        let existing_codes: Vec<String> =
            self.pools.iter().map(|entry| entry.key().clone()).collect();
        for code in existing_codes {
            match new_pool_configs.get(&code) {
                Some(new_config) => {
                    let old_config = pool_configs.get(&code).cloned();
                    let Some(old_config) = old_config else {
                        pool_configs.insert(code, new_config.clone());
                        continue;
                    };

                    let size_changed = old_config.concurrency != new_config.concurrency
                        || old_config.queue_capacity != new_config.queue_capacity;
                    let rate_changed =
                        old_config.rate_limit_per_minute != new_config.rate_limit_per_minute;

                    if size_changed {
                        // Changed pool sizes: drain the old pool, create a
                        // fresh one under the same code
                        if let Some((_, old_pool)) = self.pools.remove(&code) {
                            info!(
                                pool_code = %code,
                                old_concurrency = old_config.concurrency,
                                new_concurrency = new_config.concurrency,
                                "Pool size changed - draining old instance"
                            );
                            old_pool.begin_drain();
                            let seq = self.draining_seq.fetch_add(1, Ordering::SeqCst);
                            self.draining_pools.insert(format!("{}#{}", code, seq), old_pool);
                        }
                        self.create_pool(new_config.clone())?;
                        pools_updated += 1;
                    } else if rate_changed {
                        if let Some(pool) = self.pools.get(&code) {
                            pool.update_rate_limit(new_config.rate_limit_per_minute);
                        }
                        pools_updated += 1;
                    }

                    pool_configs.insert(code, new_config.clone());
                }
                None => {
                    // Pool removed from config: drain and destroy
                    if let Some((code, pool)) = self.pools.remove(&code) {
                        info!(
                            pool_code = %code,
                            buffer_size = pool.buffer_size(),
                            active_workers = pool.active_workers(),
                            "Pool removed from config - draining"
                        );
                        pool.begin_drain();
                        self.limiters.remove(&code);
                        let seq = self.draining_seq.fetch_add(1, Ordering::SeqCst);
                        self.draining_pools.insert(format!("{}#{}", code, seq), pool);
                        pool_configs.remove(&code);
                        pools_removed += 1;
                    }
                }
            }
        }

        // New pools
        for pool_config in &topology.pools {
            if !self.pools.contains_key(&pool_config.code) {
                match self.create_pool(pool_config.clone()) {
                    Ok(_) => {
                        pool_configs.insert(pool_config.code.clone(), pool_config.clone());
                        pools_created += 1;
                    }
                    Err(RouterError::PoolLimitReached(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        drop(pool_configs);

        let (queues_created, queues_removed) = self.sync_queue_consumers(topology).await?;

        info!(
            pools_created = pools_created,
            pools_updated = pools_updated,
            pools_removed = pools_removed,
            queues_created = queues_created,
            queues_removed = queues_removed,
            total_pools = self.pools.len(),
            draining_pools = self.draining_pools.len(),
            "Configuration reconcile complete"
        );

        Ok(())
    }

    async fn sync_queue_consumers(
        self: &Arc<Self>,
        topology: &RouterTopology,
    ) -> Result<(usize, usize)> {
        let mut queues_created = 0usize;
        let mut queues_removed = 0usize;

        let new_queue_configs: HashMap<String, QueueSettings> = topology
            .queues
            .iter()
            .map(|q| (q.identifier().to_string(), q.clone()))
            .collect();

        let mut queue_configs = self.queue_configs.write().await;
        let mut consumers = self.consumers.write().await;

        // Stop consumers whose queues were removed
        let existing: Vec<String> = consumers.keys().cloned().collect();
        for queue_id in existing {
            if !new_queue_configs.contains_key(&queue_id) {
                if let Some(consumer) = consumers.remove(&queue_id) {
                    info!(queue_id = %queue_id, "Queue removed from config - stopping consumer");
                    consumer.shutdown().await;
                    queue_configs.remove(&queue_id);
                    queues_removed += 1;
                }
            }
        }

        // Start consumers for new queues
        let factory = self.consumer_factory.read().await.clone();
        for (queue_id, settings) in &new_queue_configs {
            if consumers.contains_key(queue_id) {
                continue;
            }

            let Some(factory) = factory.as_ref() else {
                warn!(
                    queue_id = %queue_id,
                    "New queue in config but no consumer factory registered"
                );
                continue;
            };

            let router: Arc<dyn MessageRouter> = self.clone();
            match factory
                .create_consumer(settings, router, self.warning_service.clone())
                .await
            {
                Ok(consumer) => {
                    if self.active.load(Ordering::SeqCst) {
                        consumer.start();
                    }
                    consumers.insert(queue_id.clone(), consumer);
                    queue_configs.insert(queue_id.clone(), settings.clone());
                    queues_created += 1;
                    info!(queue_id = %queue_id, "Queue consumer created");
                }
                Err(e) => {
                    error!(queue_id = %queue_id, error = %e, "Failed to create queue consumer");
                    self.warning_service.add_warning(
                        WarningKind::ConsumerHealth,
                        WarningSeverity::Critical,
                        format!("Failed to create consumer for queue [{}]: {}", queue_id, e),
                        "QueueManager".to_string(),
                    );
                }
            }
        }

        Ok((queues_created, queues_removed))
    }

    /// Reap draining pools that have finished their in-flight work. Called
    /// periodically by the lifecycle manager.
    pub async fn cleanup_draining_pools(&self) {
        let mut finished = Vec::new();

        for entry in self.draining_pools.iter() {
            if entry.value().is_fully_drained() {
                finished.push(entry.key().clone());
            }
        }

        for key in finished {
            if let Some((_, pool)) = self.draining_pools.remove(&key) {
                info!(pool_code = %pool.code(), "Draining pool finished - destroying");
                pool.stop(false).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Primary/standby gating
    // ------------------------------------------------------------------

    /// Start pool workers and consumer polling. Invoked when this instance
    /// becomes primary.
    pub async fn resume(&self) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Router resuming - starting pools and consumers");

        for entry in self.pools.iter() {
            entry.value().start();
        }

        let consumers = self.consumers.read().await;
        for consumer in consumers.values() {
            consumer.start();
        }
    }

    /// Stop consumer polling, drain pools, and go fully quiescent. Invoked
    /// when this instance loses the leader lock or shuts down.
    pub async fn suspend(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Router suspending - stopping consumers and draining pools");

        {
            let consumers = self.consumers.read().await;
            for consumer in consumers.values() {
                consumer.stop().await;
            }
        }

        for entry in self.pools.iter() {
            entry.value().shutdown(self.drain_timeout).await;
        }

        let remaining = self.pipeline.len();
        if remaining > 0 {
            warn!(
                remaining = remaining,
                "In-flight messages dropped on suspend; broker will redeliver"
            );
            self.pipeline.clear();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Final shutdown: suspend and refuse any further reconfiguration.
    pub async fn shutdown(&self) {
        info!("QueueManager shutting down");
        self.running.store(false, Ordering::SeqCst);
        self.suspend().await;

        let consumers = self.consumers.read().await;
        for consumer in consumers.values() {
            consumer.shutdown().await;
        }

        for entry in self.draining_pools.iter() {
            entry.value().stop(true).await;
        }

        info!("QueueManager shutdown complete");
    }

    // ------------------------------------------------------------------
    // Monitoring
    // ------------------------------------------------------------------

    pub async fn consumer_ids(&self) -> Vec<String> {
        self.consumers.read().await.keys().cloned().collect()
    }

    pub async fn consumer_health(&self) -> Vec<relay_common::ConsumerHealth> {
        let consumers = self.consumers.read().await;
        consumers.values().map(|c| c.health()).collect()
    }

    /// Poll approximate queue depths from every consumer's broker. Each
    /// query is bounded by a 10s deadline.
    pub async fn get_queue_metrics(&self) -> Vec<QueueMetrics> {
        let consumers = self.consumers.read().await;
        let mut all = Vec::with_capacity(consumers.len());

        for (id, consumer) in consumers.iter() {
            match tokio::time::timeout(METRICS_QUERY_TIMEOUT, consumer.queue_metrics()).await {
                Ok(Ok(Some(metrics))) => all.push(metrics),
                Ok(Ok(None)) => {
                    debug!(consumer_id = %id, "Broker does not report metrics");
                }
                Ok(Err(e)) => {
                    warn!(consumer_id = %id, error = %e, "Failed to fetch queue metrics");
                }
                Err(_) => {
                    warn!(consumer_id = %id, "Queue metrics query timed out");
                }
            }
        }

        all
    }
}

#[async_trait]
impl crate::standby::StandbyListener for QueueManager {
    async fn on_become_primary(&self) {
        self.resume().await;
    }

    async fn on_become_standby(&self) {
        self.suspend().await;
    }
}

#[async_trait]
impl MessageRouter for QueueManager {
    async fn route(&self, pointer: MessagePointer, callback: Arc<dyn MessageCallback>) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }

        let Some(pool) = self.pool(&pointer.pool_code) else {
            warn!(
                message_id = %pointer.id,
                pool_code = %pointer.pool_code,
                "No pool registered for pointer"
            );
            self.warning_service.add_warning(
                WarningKind::UnknownPool,
                WarningSeverity::Warn,
                format!(
                    "No pool registered for code [{}] (message {})",
                    pointer.pool_code, pointer.id
                ),
                "QueueManager".to_string(),
            );
            return false;
        };

        if !self.pipeline.admit(&pointer, callback) {
            // Duplicate: the original completes first, then the broker
            // redelivers this copy for its own pass
            debug!(message_id = %pointer.id, "Pointer already in pipeline, refused");
            return false;
        }

        if !pool.submit(pointer.clone()) {
            self.pipeline.forget(&pointer.id);
            warn!(
                message_id = %pointer.id,
                pool_code = %pointer.pool_code,
                "Pool buffer full, pointer refused"
            );
            self.warning_service.add_warning(
                WarningKind::QueueFull,
                WarningSeverity::Warn,
                format!(
                    "Pool [{}] buffer full - refused message {}",
                    pointer.pool_code, pointer.id
                ),
                "QueueManager".to_string(),
            );
            return false;
        }

        true
    }
}
