//! Health service
//!
//! Rolling success rates per pool, consumer heartbeat aggregation and an
//! overall health report combining both with active warnings.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use relay_common::{ConsumerHealth, HealthReport, HealthStatus, PoolStats};

use crate::warning::WarningService;

#[derive(Debug, Clone)]
pub struct HealthServiceConfig {
    /// Success rate at or above which a pool counts healthy (0.0 - 1.0)
    pub healthy_threshold: f64,
    /// Rolling window for success rate calculations
    pub rolling_window: Duration,
    /// Warnings older than this no longer affect the report (minutes)
    pub warning_age_minutes: i64,
}

impl Default for HealthServiceConfig {
    fn default() -> Self {
        Self {
            healthy_threshold: 0.90,
            rolling_window: Duration::from_secs(30 * 60),
            warning_age_minutes: 30,
        }
    }
}

/// Rolling success/failure window for one pool.
#[derive(Debug, Default)]
struct RollingCounter {
    events: Vec<(Instant, bool)>,
}

impl RollingCounter {
    fn record(&mut self, success: bool, window: Duration) {
        self.events.push((Instant::now(), success));
        let cutoff = Instant::now() - window;
        self.events.retain(|(t, _)| *t > cutoff);
    }

    fn success_rate(&self, window: Duration) -> Option<f64> {
        let cutoff = Instant::now() - window;
        let recent: Vec<_> = self.events.iter().filter(|(t, _)| *t > cutoff).collect();
        if recent.is_empty() {
            return None;
        }
        let successes = recent.iter().filter(|(_, s)| *s).count();
        Some(successes as f64 / recent.len() as f64)
    }
}

/// System health aggregation.
pub struct HealthService {
    config: HealthServiceConfig,
    warning_service: Arc<WarningService>,
    pool_counters: RwLock<HashMap<String, RollingCounter>>,
}

impl HealthService {
    pub fn new(config: HealthServiceConfig, warning_service: Arc<WarningService>) -> Self {
        Self {
            config,
            warning_service,
            pool_counters: RwLock::new(HashMap::new()),
        }
    }

    /// Record one mediation outcome for a pool.
    pub fn record_pool_result(&self, pool_code: &str, success: bool) {
        let mut counters = self.pool_counters.write();
        counters
            .entry(pool_code.to_string())
            .or_default()
            .record(success, self.config.rolling_window);
    }

    pub fn get_pool_success_rate(&self, pool_code: &str) -> Option<f64> {
        self.pool_counters
            .read()
            .get(pool_code)
            .and_then(|c| c.success_rate(self.config.rolling_window))
    }

    /// Combine pool rates, consumer heartbeats and warnings into one report.
    pub fn get_health_report(
        &self,
        pool_stats: &[PoolStats],
        consumer_health: &[ConsumerHealth],
    ) -> HealthReport {
        let mut issues = Vec::new();

        let mut pools_healthy = 0u32;
        let mut pools_unhealthy = 0u32;

        for stat in pool_stats {
            match self.get_pool_success_rate(&stat.pool_code) {
                Some(rate) if rate < self.config.healthy_threshold => {
                    pools_unhealthy += 1;
                    issues.push(format!(
                        "Pool {} success rate: {:.1}%",
                        stat.pool_code,
                        rate * 100.0
                    ));
                }
                // No data yet counts healthy
                _ => pools_healthy += 1,
            }
        }

        let consumers_unhealthy = consumer_health.iter().filter(|c| !c.is_healthy).count() as u32;
        let consumers_healthy = consumer_health.len() as u32 - consumers_unhealthy;

        for consumer in consumer_health.iter().filter(|c| !c.is_healthy) {
            issues.push(format!("Consumer {} is unhealthy", consumer.queue_identifier));
        }

        let active_warnings = self
            .warning_service
            .get_active_warnings(self.config.warning_age_minutes)
            .len() as u32;
        let critical_warnings = self.warning_service.critical_count() as u32;

        if critical_warnings > 0 {
            issues.push(format!("{} critical warnings", critical_warnings));
        }

        let status = if critical_warnings > 0
            || (pools_unhealthy > 0 && pools_healthy == 0)
            || (consumers_unhealthy > 0 && consumers_healthy == 0 && !consumer_health.is_empty())
        {
            HealthStatus::Degraded
        } else if pools_unhealthy > 0 || consumers_unhealthy > 0 || active_warnings > 0 {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        if status != HealthStatus::Healthy {
            debug!(
                status = ?status,
                pools_healthy,
                pools_unhealthy,
                consumers_healthy,
                consumers_unhealthy,
                active_warnings,
                "Health report generated"
            );
        }

        HealthReport {
            status,
            pools_healthy,
            pools_unhealthy,
            consumers_healthy,
            consumers_unhealthy,
            active_warnings,
            critical_warnings,
            issues,
        }
    }
}
