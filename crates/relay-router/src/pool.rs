//! ProcessPool - bounded work-dispatcher for one pool code
//!
//! - Bounded FIFO buffer with non-blocking admission
//! - Semaphore-guarded concurrency with C worker tasks
//! - Per-message-group head-of-line serialization via a keyed map
//! - Non-blocking rate limiting with fast-fail visibility
//! - Batch+group cascade nacks to preserve FIFO under mid-batch failure

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use relay_common::{MediationResult, MessagePointer, PoolConfig, PoolStats};

use crate::mediator::Mediator;
use crate::metrics::PoolMetricsCollector;
use crate::pipeline::PipelineRegistry;
use crate::rate_limit::RateLimiterRegistry;
use crate::router_metrics;

/// Synthetic group for pointers without a `messageGroupId`; imposes no
/// ordering, every such pointer runs independently.
const DEFAULT_GROUP: &str = "__DEFAULT__";

/// How long a worker waits on the buffer before re-checking shutdown.
const WORKER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default bounded drain window on shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Pool lifecycle. Only `Running` accepts submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Initialized,
    Running,
    Draining,
    Stopped,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PoolState::Running,
            2 => PoolState::Draining,
            3 => PoolState::Stopped,
            _ => PoolState::Initialized,
        }
    }
}

/// Composite key for batch+group failure tracking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchGroupKey {
    pub batch_id: Arc<str>,
    pub group_id: Arc<str>,
}

impl BatchGroupKey {
    #[inline]
    pub fn new(batch_id: &str, group_id: &str) -> Self {
        Self {
            batch_id: Arc::from(batch_id),
            group_id: Arc::from(group_id),
        }
    }
}

impl std::fmt::Display for BatchGroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.batch_id, self.group_id)
    }
}

/// Unit of work queued in the pool.
struct PoolTask {
    pointer: MessagePointer,
    group: Arc<str>,
    batch_key: Option<BatchGroupKey>,
}

/// Sub-queue for one message group: head dispatched, rest pending.
#[derive(Default)]
struct GroupQueue {
    pending: VecDeque<PoolTask>,
    running: bool,
}

/// Bounded work-dispatcher for one pool code.
pub struct ProcessPool {
    config: PoolConfig,
    mediator: Arc<dyn Mediator>,
    pipeline: Arc<PipelineRegistry>,
    limiters: Arc<RateLimiterRegistry>,

    /// Concurrency permits; `active workers = C - available`
    permits: Arc<Semaphore>,

    /// Ready-to-run tasks. The bound is enforced by `buffer_size`, not the
    /// channel, so sends never block.
    ready_tx: mpsc::UnboundedSender<PoolTask>,
    ready_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PoolTask>>,

    /// Per-group sub-queues keyed by `messageGroupId`
    groups: DashMap<Arc<str>, GroupQueue>,

    /// (batch, group) pairs that have seen a failure
    failed_batch_groups: DashSet<BatchGroupKey>,

    /// Remaining message count per (batch, group), for cleanup
    batch_group_counts: DashMap<BatchGroupKey, AtomicU32>,

    /// Runtime-updatable rate limit; key is the pool code
    rate_limit_per_minute: RwLock<Option<u32>>,

    /// Accepted-but-unfinished-dequeue count; never exceeds Q
    buffer_size: AtomicU32,

    state: AtomicU8,
    shutdown_tx: watch::Sender<bool>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,

    metrics: Arc<PoolMetricsCollector>,
}

impl ProcessPool {
    pub fn new(
        config: PoolConfig,
        mediator: Arc<dyn Mediator>,
        pipeline: Arc<PipelineRegistry>,
        limiters: Arc<RateLimiterRegistry>,
    ) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let rate_limit = config.rate_limit_per_minute;

        Self {
            permits: Arc::new(Semaphore::new(config.concurrency as usize)),
            config,
            mediator,
            pipeline,
            limiters,
            ready_tx,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
            groups: DashMap::new(),
            failed_batch_groups: DashSet::new(),
            batch_group_counts: DashMap::new(),
            rate_limit_per_minute: RwLock::new(rate_limit),
            buffer_size: AtomicU32::new(0),
            state: AtomicU8::new(0),
            shutdown_tx,
            workers: parking_lot::Mutex::new(Vec::new()),
            metrics: Arc::new(PoolMetricsCollector::new()),
        }
    }

    /// Spawn the worker tasks and start accepting submissions. Re-enterable
    /// after `stop` (standby resume).
    pub fn start(self: &Arc<Self>) {
        match self.state() {
            PoolState::Running | PoolState::Draining => return,
            PoolState::Initialized | PoolState::Stopped => {}
        }

        self.shutdown_tx.send_replace(false);
        let mut workers = self.workers.lock();
        for worker_id in 0..self.config.concurrency {
            let pool = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                pool.run_worker(worker_id).await;
            }));
        }
        drop(workers);

        self.state.store(PoolState::Running as u8, Ordering::SeqCst);

        info!(
            pool_code = %self.config.code,
            concurrency = self.config.concurrency,
            queue_capacity = self.config.queue_capacity,
            rate_limit = ?self.config.rate_limit_per_minute,
            "Process pool started"
        );
    }

    /// Non-blocking admission. Returns false when the pool is not running or
    /// the buffer is full; the caller rolls back and relies on broker
    /// redelivery.
    pub fn submit(&self, pointer: MessagePointer) -> bool {
        if self.state() != PoolState::Running {
            return false;
        }

        // Reserve a buffer slot without overshooting Q
        let mut current = self.buffer_size.load(Ordering::SeqCst);
        loop {
            if current >= self.config.queue_capacity {
                router_metrics::record_message_rejected(&self.config.code, "buffer_full");
                return false;
            }
            match self.buffer_size.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.metrics.record_submitted();
        router_metrics::record_message_submitted(&self.config.code);
        router_metrics::set_pool_buffer_size(
            &self.config.code,
            self.buffer_size.load(Ordering::SeqCst),
        );

        let group: Arc<str> = pointer
            .message_group_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(Arc::from)
            .unwrap_or_else(|| Arc::from(DEFAULT_GROUP));

        let batch_key = pointer
            .batch_id
            .as_deref()
            .map(|batch_id| BatchGroupKey::new(batch_id, &group));

        if let Some(key) = &batch_key {
            self.batch_group_counts
                .entry(key.clone())
                .or_insert_with(|| AtomicU32::new(0))
                .fetch_add(1, Ordering::SeqCst);
        }

        let task = PoolTask {
            pointer,
            group: Arc::clone(&group),
            batch_key,
        };

        if &*group == DEFAULT_GROUP {
            self.dispatch(task);
        } else {
            // Head-of-line dispatch: at most one task per group is ever in
            // the ready channel; the rest wait in the group's sub-queue.
            let dispatch_now = {
                let mut entry = self.groups.entry(Arc::clone(&group)).or_default();
                if entry.running {
                    entry.pending.push_back(task);
                    None
                } else {
                    entry.running = true;
                    Some(task)
                }
            };
            if let Some(task) = dispatch_now {
                self.dispatch(task);
            }
            router_metrics::set_pool_message_groups(&self.config.code, self.groups.len() as u32);
        }

        true
    }

    fn dispatch(&self, task: PoolTask) {
        // Receiver lives as long as the pool; failure only after teardown
        let _ = self.ready_tx.send(task);
    }

    async fn run_worker(self: Arc<Self>, worker_id: u32) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        debug!(pool_code = %self.config.code, worker_id, "Worker started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let task = {
                let mut rx = self.ready_rx.lock().await;
                match tokio::time::timeout(WORKER_POLL_INTERVAL, rx.recv()).await {
                    Ok(Some(task)) => task,
                    Ok(None) => break,
                    Err(_) => continue,
                }
            };

            self.process(task).await;
        }

        debug!(pool_code = %self.config.code, worker_id, "Worker exited");
    }

    async fn process(&self, task: PoolTask) {
        self.buffer_size.fetch_sub(1, Ordering::SeqCst);
        router_metrics::set_pool_buffer_size(
            &self.config.code,
            self.buffer_size.load(Ordering::SeqCst),
        );

        let PoolTask {
            pointer,
            group,
            batch_key,
        } = task;

        // An earlier failure in this (batch, group) nacks the rest without
        // touching the mediator, preserving FIFO across the batch.
        if let Some(key) = &batch_key {
            if self.failed_batch_groups.contains(key) {
                warn!(
                    message_id = %pointer.id,
                    batch_group = %key,
                    "Cascade-NACK from failed batch+group"
                );
                self.pipeline.nack(&pointer).await;
                self.cleanup_batch_group(key);
                self.finish_group(&group);
                return;
            }
        }

        let permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                self.pipeline.nack(&pointer).await;
                if let Some(key) = &batch_key {
                    self.cleanup_batch_group(key);
                }
                self.finish_group(&group);
                return;
            }
        };
        self.update_worker_gauges();

        // Rate limit: non-blocking acquire keyed by pool code. A refused
        // permit fast-fails the message back to the broker (~1s visibility).
        let rate_limit = *self.rate_limit_per_minute.read();
        if let Some(per_minute) = rate_limit {
            if per_minute > 0 && !self.limiters.try_acquire(&self.config.code, per_minute) {
                debug!(
                    message_id = %pointer.id,
                    pool_code = %self.config.code,
                    "Rate limited, fast-fail NACK"
                );
                self.metrics.record_rate_limited();
                router_metrics::record_rate_limit_exceeded(&self.config.code);

                if let Some(callback) = self.pipeline.callback(&pointer.id) {
                    if callback.supports_visibility_control() {
                        callback.set_fast_fail_visibility(&pointer).await;
                    }
                }
                self.pipeline.nack(&pointer).await;

                if let Some(key) = &batch_key {
                    self.cleanup_batch_group(key);
                }
                drop(permit);
                self.update_worker_gauges();
                self.finish_group(&group);
                return;
            }
        }

        let start = Instant::now();
        let outcome = self.mediator.process(&pointer).await;
        let elapsed = start.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;
        router_metrics::record_mediation_latency(&self.config.code, elapsed);

        match outcome.result {
            MediationResult::Success => {
                debug!(
                    message_id = %pointer.id,
                    duration_ms = elapsed_ms,
                    "Message processed"
                );
                self.metrics.record_success(elapsed_ms);
                router_metrics::record_message_processed(&self.config.code, true, "success");
                self.pipeline.ack(&pointer).await;
            }
            result => {
                warn!(
                    message_id = %pointer.id,
                    result = ?result,
                    status_code = ?outcome.status_code,
                    error = ?outcome.error_message,
                    deferred = outcome.deferred,
                    "Mediation failed, NACKing for redelivery"
                );

                if !outcome.deferred {
                    self.metrics.record_failure(elapsed_ms);
                    router_metrics::record_message_processed(
                        &self.config.code,
                        false,
                        result_label(result),
                    );
                }

                // Mark the batch+group so queued successors cascade-nack
                if let Some(key) = &batch_key {
                    if self.failed_batch_groups.insert(key.clone()) {
                        warn!(
                            batch_group = %key,
                            "Batch+group marked failed; queued successors will be NACKed"
                        );
                    }
                }

                if let Some(callback) = self.pipeline.callback(&pointer.id) {
                    if callback.supports_visibility_control() {
                        callback.reset_visibility_to_default(&pointer).await;
                    }
                }
                self.pipeline.nack(&pointer).await;
            }
        }

        if let Some(key) = &batch_key {
            self.cleanup_batch_group(key);
        }
        drop(permit);
        self.update_worker_gauges();
        self.finish_group(&group);
    }

    /// Completion hook for a grouped task: dispatch the next head, or flip
    /// the group idle and delete the empty entry.
    fn finish_group(&self, group: &Arc<str>) {
        if &**group == DEFAULT_GROUP {
            return;
        }

        let next = {
            if let Some(mut entry) = self.groups.get_mut(group) {
                if let Some(task) = entry.pending.pop_front() {
                    Some(task)
                } else {
                    entry.running = false;
                    None
                }
            } else {
                None
            }
        };
        // Entry guard dropped before any removal

        match next {
            Some(task) => self.dispatch(task),
            None => {
                self.groups
                    .remove_if(group, |_, queue| !queue.running && queue.pending.is_empty());
            }
        }

        router_metrics::set_pool_message_groups(&self.config.code, self.groups.len() as u32);
    }

    /// Decrement the (batch, group) count; once every member completed, the
    /// failure marker and counter are dropped.
    fn cleanup_batch_group(&self, key: &BatchGroupKey) {
        let exhausted = if let Some(counter) = self.batch_group_counts.get(key) {
            counter.fetch_sub(1, Ordering::SeqCst).saturating_sub(1) == 0
        } else {
            false
        };
        // Guard dropped before mutating the maps

        if exhausted {
            self.batch_group_counts.remove(key);
            self.failed_batch_groups.remove(key);
            debug!(batch_group = %key, "Batch+group fully processed, cleaned up");
        }
    }

    fn update_worker_gauges(&self) {
        let available = self.permits.available_permits() as u32;
        router_metrics::set_pool_available_permits(&self.config.code, available);
        router_metrics::set_pool_active_workers(
            &self.config.code,
            self.config.concurrency.saturating_sub(available),
        );
    }

    /// Stop accepting submissions; queued and in-flight work keeps running.
    pub fn begin_drain(&self) {
        let state = self.state();
        if state == PoolState::Running {
            self.state.store(PoolState::Draining as u8, Ordering::SeqCst);
            info!(pool_code = %self.config.code, "Pool draining");
        } else if state == PoolState::Initialized {
            self.state.store(PoolState::Stopped as u8, Ordering::SeqCst);
        }
    }

    pub fn is_fully_drained(&self) -> bool {
        self.buffer_size.load(Ordering::SeqCst) == 0
            && self.permits.available_permits() == self.config.concurrency as usize
    }

    /// Signal workers and wait for them to exit; `force` aborts instead of
    /// waiting out in-flight work.
    pub async fn stop(&self, force: bool) {
        self.shutdown_tx.send_replace(true);

        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if force {
                handle.abort();
            } else {
                let abort = handle.abort_handle();
                if tokio::time::timeout(2 * WORKER_POLL_INTERVAL, handle)
                    .await
                    .is_err()
                {
                    abort.abort();
                }
            }
        }

        self.state.store(PoolState::Stopped as u8, Ordering::SeqCst);
        info!(pool_code = %self.config.code, "Pool stopped");
    }

    /// Drain within `drain_timeout`, then terminate workers. Past the
    /// deadline workers are force-cancelled and unfinished pointers are left
    /// for broker redelivery.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.begin_drain();

        let deadline = Instant::now() + drain_timeout;
        while Instant::now() < deadline {
            if self.is_fully_drained() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let timed_out = !self.is_fully_drained();
        if timed_out {
            warn!(
                pool_code = %self.config.code,
                buffer_size = self.buffer_size.load(Ordering::SeqCst),
                "Drain deadline passed, force-cancelling workers"
            );
        }
        self.stop(timed_out).await;
    }

    /// Replace the rate limit in place; takes effect on the next dequeue.
    pub fn update_rate_limit(&self, per_minute: Option<u32>) {
        let old = *self.rate_limit_per_minute.read();
        if old == per_minute {
            return;
        }
        *self.rate_limit_per_minute.write() = per_minute;
        info!(
            pool_code = %self.config.code,
            old = ?old,
            new = ?per_minute,
            "Pool rate limit updated"
        );
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn code(&self) -> &str {
        &self.config.code
    }

    pub fn concurrency(&self) -> u32 {
        self.config.concurrency
    }

    pub fn queue_capacity(&self) -> u32 {
        self.config.queue_capacity
    }

    pub fn rate_limit_per_minute(&self) -> Option<u32> {
        *self.rate_limit_per_minute.read()
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> u32 {
        self.config
            .concurrency
            .saturating_sub(self.permits.available_permits() as u32)
    }

    pub fn active_groups(&self) -> u32 {
        self.groups.len() as u32
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool_code: self.config.code.clone(),
            concurrency: self.config.concurrency,
            queue_capacity: self.config.queue_capacity,
            active_workers: self.active_workers(),
            available_permits: self.permits.available_permits() as u32,
            buffer_size: self.buffer_size(),
            active_groups: self.active_groups(),
            rate_limit_per_minute: self.rate_limit_per_minute(),
            counters: self.metrics.counters(),
            processing_time: self.metrics.processing_time(),
        }
    }

    /// Reset in-process counters; used by tests.
    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }
}

fn result_label(result: MediationResult) -> &'static str {
    match result {
        MediationResult::Success => "success",
        MediationResult::ErrorProcess => "error_process",
        MediationResult::ErrorServer => "error_server",
        MediationResult::ErrorConnection => "error_connection",
        MediationResult::RateLimited => "rate_limited",
    }
}
