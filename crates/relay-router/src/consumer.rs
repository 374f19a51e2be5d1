//! Queue consumer driver
//!
//! Runs N connection tasks over one broker queue. Each iteration updates a
//! heartbeat, fetches a batch under a hard deadline, stamps a fresh batch id
//! and routes every parsed pointer. Unparseable bodies are poison: warned
//! and acked so they never retry.
//!
//! SYNC mode runs one blocking poll loop per connection. ASYNC mode keeps N
//! polls in flight, each re-scheduling its successor through the task
//! system; shutdown waits for the in-flight polls within a bounded window.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use relay_common::{
    ConsumerHealth, ConsumerMode, MessageCallback, MessagePointer, QueueSettings, WarningKind,
    WarningSeverity,
};
use relay_queue::{BrokerQueue, QueueMetrics, RawDelivery};

use crate::manager::MessageRouter;
use crate::router_metrics;
use crate::warning::WarningService;

/// Driver tuning; defaults follow the broker contract (25s fetch deadline,
/// 1s error backoff, 30s bounded shutdown, 60s heartbeat stall).
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub connections: u32,
    pub max_messages_per_poll: u32,
    pub mode: ConsumerMode,
    /// Hard deadline around one broker fetch (long poll included)
    pub fetch_timeout: Duration,
    /// Pause after a fetch error before polling again
    pub error_backoff: Duration,
    /// How long shutdown waits for in-flight polls
    pub shutdown_timeout: Duration,
    /// Visibility for rate-limited fast-fail redelivery
    pub fast_fail_visibility_seconds: u32,
    /// Visibility for failed-message redelivery
    pub default_visibility_seconds: u32,
    /// Heartbeat age beyond which the consumer reports unhealthy
    pub heartbeat_stall: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            connections: 1,
            max_messages_per_poll: 10,
            mode: ConsumerMode::Sync,
            fetch_timeout: Duration::from_secs(25),
            error_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            fast_fail_visibility_seconds: 1,
            default_visibility_seconds: 30,
            heartbeat_stall: Duration::from_secs(60),
        }
    }
}

impl ConsumerSettings {
    pub fn from_queue_settings(settings: &QueueSettings) -> Self {
        Self {
            connections: settings.connections.max(1),
            max_messages_per_poll: settings.max_messages_per_poll.clamp(1, 10),
            mode: settings.consumer_mode,
            default_visibility_seconds: settings.visibility_timeout_seconds,
            ..Default::default()
        }
    }
}

/// Per-queue driver feeding the router.
pub struct QueueConsumer {
    broker: Arc<dyn BrokerQueue>,
    router: Arc<dyn MessageRouter>,
    warning_service: Arc<WarningService>,
    settings: ConsumerSettings,

    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    /// Millis since consumer creation at the last loop iteration
    last_heartbeat_ms: AtomicU64,
    started_at: Instant,
    active_polls: Arc<AtomicU32>,
    batch_counter: AtomicU64,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl QueueConsumer {
    pub fn new(
        broker: Arc<dyn BrokerQueue>,
        router: Arc<dyn MessageRouter>,
        warning_service: Arc<WarningService>,
        settings: ConsumerSettings,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(true);
        Arc::new(Self {
            broker,
            router,
            warning_service,
            settings,
            running: AtomicBool::new(false),
            stop_tx,
            last_heartbeat_ms: AtomicU64::new(0),
            started_at: Instant::now(),
            active_polls: Arc::new(AtomicU32::new(0)),
            batch_counter: AtomicU64::new(0),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn identifier(&self) -> &str {
        self.broker.identifier()
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Spawn the connection tasks. Restartable after `stop` (standby
    /// resume).
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_tx.send_replace(false);
        self.touch_heartbeat();

        info!(
            queue = %self.identifier(),
            connections = self.settings.connections,
            mode = ?self.settings.mode,
            "Starting queue consumer"
        );

        let mut tasks = self.tasks.lock();
        for connection_id in 0..self.settings.connections {
            match self.settings.mode {
                ConsumerMode::Sync => {
                    let consumer = Arc::clone(self);
                    tasks.push(tokio::spawn(async move {
                        consumer.run_sync_loop(connection_id).await;
                    }));
                }
                ConsumerMode::Async => {
                    Self::spawn_poll(Arc::clone(self), connection_id);
                }
            }
        }
    }

    async fn run_sync_loop(self: Arc<Self>, connection_id: u32) {
        let mut stop_rx = self.stop_tx.subscribe();
        debug!(queue = %self.identifier(), connection_id, "Sync fetch loop started");

        while !*stop_rx.borrow() {
            self.touch_heartbeat();

            tokio::select! {
                _ = stop_rx.changed() => break,
                fetched = tokio::time::timeout(
                    self.settings.fetch_timeout,
                    self.broker.fetch(self.settings.max_messages_per_poll),
                ) => {
                    match fetched {
                        Ok(Ok(batch)) => {
                            router_metrics::record_consumer_poll(
                                self.identifier(),
                                batch.len() as u32,
                            );
                            if !batch.is_empty() {
                                self.dispatch_batch(batch).await;
                            }
                        }
                        Ok(Err(relay_queue::QueueError::Stopped)) => break,
                        Ok(Err(e)) => {
                            warn!(
                                queue = %self.identifier(),
                                error = %e,
                                "Fetch failed, backing off"
                            );
                            router_metrics::record_consumer_error(self.identifier(), "fetch");
                            tokio::time::sleep(self.settings.error_backoff).await;
                        }
                        Err(_) => {
                            warn!(
                                queue = %self.identifier(),
                                "Fetch exceeded hard deadline"
                            );
                            router_metrics::record_consumer_error(self.identifier(), "timeout");
                        }
                    }
                }
            }
        }

        debug!(queue = %self.identifier(), connection_id, "Sync fetch loop exited");
    }

    /// One in-flight poll that chains its successor on completion. Spawning
    /// the next poll through the task system keeps the chain flat.
    fn spawn_poll(consumer: Arc<Self>, connection_id: u32) {
        if !consumer.running.load(Ordering::SeqCst) {
            return;
        }
        consumer.active_polls.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            consumer.touch_heartbeat();

            let fetched = tokio::time::timeout(
                consumer.settings.fetch_timeout,
                consumer.broker.fetch(consumer.settings.max_messages_per_poll),
            )
            .await;

            let mut stopped = false;
            match fetched {
                Ok(Ok(batch)) => {
                    router_metrics::record_consumer_poll(consumer.identifier(), batch.len() as u32);
                    if !batch.is_empty() {
                        consumer.dispatch_batch(batch).await;
                    }
                }
                Ok(Err(relay_queue::QueueError::Stopped)) => stopped = true,
                Ok(Err(e)) => {
                    warn!(
                        queue = %consumer.identifier(),
                        connection_id,
                        error = %e,
                        "Async poll failed, retrying after backoff"
                    );
                    router_metrics::record_consumer_error(consumer.identifier(), "fetch");
                    tokio::time::sleep(consumer.settings.error_backoff).await;
                }
                Err(_) => {
                    warn!(
                        queue = %consumer.identifier(),
                        connection_id,
                        "Async poll exceeded hard deadline"
                    );
                    router_metrics::record_consumer_error(consumer.identifier(), "timeout");
                }
            }

            consumer.active_polls.fetch_sub(1, Ordering::SeqCst);
            if !stopped {
                Self::spawn_poll(consumer, connection_id);
            }
        });
    }

    /// Parse and route one fetched batch under a fresh batch id.
    async fn dispatch_batch(&self, batch: Vec<RawDelivery>) {
        let batch_id = format!(
            "{}-{}",
            self.identifier(),
            self.batch_counter.fetch_add(1, Ordering::SeqCst)
        );

        for raw in batch {
            let mut pointer = match serde_json::from_slice::<MessagePointer>(&raw.body) {
                Ok(pointer) => pointer,
                Err(e) => {
                    self.drop_poison(&raw, &format!("parse failure: {}", e)).await;
                    continue;
                }
            };

            if !pointer.is_valid() {
                self.drop_poison(&raw, "missing id or pool code").await;
                continue;
            }

            // Lift the broker-level group property when the body has none
            if pointer.message_group_id.is_none() {
                pointer.message_group_id = raw.message_group_id.clone();
            }
            pointer.batch_id = Some(batch_id.clone());

            let callback: Arc<dyn MessageCallback> = Arc::new(BrokerCallback {
                broker: self.broker.clone(),
                receipt_handle: raw.receipt_handle,
                fast_fail_visibility_seconds: self.settings.fast_fail_visibility_seconds,
                default_visibility_seconds: self.settings.default_visibility_seconds,
            });

            let accepted = self.router.route(pointer, callback).await;
            if !accepted {
                // Refused admission: leave the message unacked; the broker
                // re-offers it after the visibility window
                debug!(queue = %self.identifier(), "Pointer refused by router");
            }
        }
    }

    /// Poison handling: a message that cannot become a valid pointer is
    /// warned about and acked so it never retries.
    async fn drop_poison(&self, raw: &RawDelivery, reason: &str) {
        warn!(
            queue = %self.identifier(),
            broker_message_id = ?raw.broker_message_id,
            reason = %reason,
            "Poison message, acking to drop"
        );
        self.warning_service.add_warning(
            WarningKind::PoisonMessage,
            WarningSeverity::Warn,
            format!(
                "Dropped unparseable message from queue [{}]: {}",
                self.identifier(),
                reason
            ),
            format!("Consumer:{}", self.identifier()),
        );
        if let Err(e) = self.broker.ack(&raw.receipt_handle).await {
            warn!(queue = %self.identifier(), error = %e, "Failed to drop poison message");
        }
    }

    fn touch_heartbeat(&self) {
        self.last_heartbeat_ms
            .store(self.started_at.elapsed().as_millis() as u64, Ordering::SeqCst);
    }

    /// Pause polling; the broker handle stays open so `start` can resume.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_tx.send_replace(true);
        info!(queue = %self.identifier(), "Stopping queue consumer");

        // Async mode: wait for the in-flight polls within the bounded window
        let deadline = Instant::now() + self.settings.shutdown_timeout;
        while self.active_polls.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.settings.shutdown_timeout, handle)
                .await
                .is_err()
            {
                warn!(queue = %self.identifier(), "Connection task exceeded shutdown window, aborting");
                abort.abort();
            }
        }
    }

    /// Final shutdown: stop polling and release the broker handle.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.broker.stop().await;
    }

    /// Unhealthy when not running or when no loop iteration has run within
    /// the stall window.
    pub fn is_healthy(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        self.seconds_since_heartbeat()
            .map(|age| age < self.settings.heartbeat_stall.as_secs())
            .unwrap_or(false)
    }

    fn seconds_since_heartbeat(&self) -> Option<u64> {
        let heartbeat_ms = self.last_heartbeat_ms.load(Ordering::SeqCst);
        if heartbeat_ms == 0 && !self.running.load(Ordering::SeqCst) {
            return None;
        }
        let now_ms = self.started_at.elapsed().as_millis() as u64;
        Some(now_ms.saturating_sub(heartbeat_ms) / 1000)
    }

    pub fn health(&self) -> ConsumerHealth {
        ConsumerHealth {
            queue_identifier: self.identifier().to_string(),
            is_running: self.running.load(Ordering::SeqCst),
            is_healthy: self.is_healthy(),
            seconds_since_heartbeat: self.seconds_since_heartbeat(),
        }
    }

    pub async fn queue_metrics(&self) -> relay_queue::Result<Option<QueueMetrics>> {
        self.broker.metrics().await
    }
}

/// Ties broker-specific completion to one fetched message.
struct BrokerCallback {
    broker: Arc<dyn BrokerQueue>,
    receipt_handle: String,
    fast_fail_visibility_seconds: u32,
    default_visibility_seconds: u32,
}

#[async_trait]
impl MessageCallback for BrokerCallback {
    async fn ack(&self, pointer: &MessagePointer) {
        if let Err(e) = self.broker.ack(&self.receipt_handle).await {
            // Stale receipt handles are benign: the redelivered copy will be
            // admitted anew and completed on its own pass
            warn!(
                message_id = %pointer.id,
                queue = %self.broker.identifier(),
                error = %e,
                "ACK failed"
            );
        }
    }

    async fn nack(&self, pointer: &MessagePointer) {
        if let Err(e) = self.broker.nack(&self.receipt_handle).await {
            warn!(
                message_id = %pointer.id,
                queue = %self.broker.identifier(),
                error = %e,
                "NACK failed"
            );
        }
    }

    fn supports_visibility_control(&self) -> bool {
        self.broker.supports_visibility_control()
    }

    async fn set_fast_fail_visibility(&self, pointer: &MessagePointer) {
        if let Err(e) = self
            .broker
            .change_visibility(&self.receipt_handle, self.fast_fail_visibility_seconds)
            .await
        {
            warn!(
                message_id = %pointer.id,
                error = %e,
                "Failed to set fast-fail visibility"
            );
        }
    }

    async fn reset_visibility_to_default(&self, pointer: &MessagePointer) {
        if let Err(e) = self
            .broker
            .change_visibility(&self.receipt_handle, self.default_visibility_seconds)
            .await
        {
            warn!(
                message_id = %pointer.id,
                error = %e,
                "Failed to reset visibility"
            );
        }
    }
}
