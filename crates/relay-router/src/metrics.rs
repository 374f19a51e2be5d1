//! Per-pool metrics collection
//!
//! Monotonic counters plus a bounded sample window for processing-time
//! percentiles. Thread-safe for concurrent workers.

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use relay_common::{PoolCounters, ProcessingTimeStats};

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Maximum duration samples retained for percentile calculations
    pub max_samples: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { max_samples: 10000 }
    }
}

/// Counter and timer collection for one pool.
pub struct PoolMetricsCollector {
    config: MetricsConfig,
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
    samples: RwLock<VecDeque<u64>>,
}

impl PoolMetricsCollector {
    pub fn new() -> Self {
        Self::with_config(MetricsConfig::default())
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        let max_samples = config.max_samples;
        Self {
            config,
            submitted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            samples: RwLock::new(VecDeque::with_capacity(max_samples.min(1024))),
        }
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, duration_ms: u64) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.add_sample(duration_ms);
    }

    pub fn record_failure(&self, duration_ms: u64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.add_sample(duration_ms);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    fn add_sample(&self, duration_ms: u64) {
        let mut samples = self.samples.write();
        if samples.len() >= self.config.max_samples {
            samples.pop_front();
        }
        samples.push_back(duration_ms);
    }

    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }

    pub fn processing_time(&self) -> ProcessingTimeStats {
        let samples = self.samples.read();
        let durations: Vec<u64> = samples.iter().copied().collect();
        drop(samples);
        Self::calculate(&durations)
    }

    fn calculate(durations: &[u64]) -> ProcessingTimeStats {
        if durations.is_empty() {
            return ProcessingTimeStats::default();
        }

        let mut sorted = durations.to_vec();
        sorted.sort_unstable();

        let sum: u64 = sorted.iter().sum();
        let count = sorted.len() as u64;

        ProcessingTimeStats {
            avg_ms: sum as f64 / count as f64,
            min_ms: sorted[0],
            max_ms: sorted[sorted.len() - 1],
            p50_ms: Self::percentile(&sorted, 50.0),
            p95_ms: Self::percentile(&sorted, 95.0),
            p99_ms: Self::percentile(&sorted, 99.0),
            sample_count: count,
        }
    }

    fn percentile(sorted: &[u64], p: f64) -> u64 {
        if sorted.is_empty() {
            return 0;
        }
        if sorted.len() == 1 {
            return sorted[0];
        }

        let idx = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    /// Reset everything; used by tests.
    pub fn reset(&self) {
        self.submitted.store(0, Ordering::Relaxed);
        self.succeeded.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.rate_limited.store(0, Ordering::Relaxed);
        self.samples.write().clear();
    }
}

impl Default for PoolMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
