//! Warning service
//!
//! Bounded in-memory warning sink. Components report operational anomalies
//! here; retention is count- and age-limited, and warnings can be
//! acknowledged so health checks stop counting them.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

use relay_common::{Warning, WarningKind, WarningSeverity};

#[derive(Debug, Clone)]
pub struct WarningServiceConfig {
    /// Maximum age in hours before a warning is dropped
    pub max_warning_age_hours: i64,
    /// Maximum number of warnings retained
    pub max_warnings: usize,
    /// Warnings older than this are auto-acknowledged (hours)
    pub auto_acknowledge_hours: i64,
}

impl Default for WarningServiceConfig {
    fn default() -> Self {
        Self {
            max_warning_age_hours: 24,
            max_warnings: 1000,
            auto_acknowledge_hours: 8,
        }
    }
}

/// In-memory warning store.
pub struct WarningService {
    warnings: RwLock<HashMap<String, Warning>>,
    config: WarningServiceConfig,
}

impl WarningService {
    pub fn new(config: WarningServiceConfig) -> Self {
        Self {
            warnings: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Record a warning, returning its id.
    pub fn add_warning(
        &self,
        kind: WarningKind,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> String {
        let warning = Warning::new(kind, severity, message, source);
        let id = warning.id.clone();

        let mut warnings = self.warnings.write();

        if warnings.len() >= self.config.max_warnings {
            Self::evict_oldest(&mut warnings);
        }

        debug!(
            id = %id,
            kind = ?warning.kind,
            severity = ?warning.severity,
            message = %warning.message,
            "Warning recorded"
        );

        warnings.insert(id.clone(), warning);
        id
    }

    pub fn get_all_warnings(&self) -> Vec<Warning> {
        self.warnings.read().values().cloned().collect()
    }

    pub fn get_warnings_by_kind(&self, kind: WarningKind) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| w.kind == kind)
            .cloned()
            .collect()
    }

    pub fn get_warnings_by_severity(&self, severity: WarningSeverity) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| w.severity == severity)
            .cloned()
            .collect()
    }

    /// Unacknowledged warnings no older than `max_age_minutes`.
    pub fn get_active_warnings(&self, max_age_minutes: i64) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| !w.acknowledged && w.age_minutes() <= max_age_minutes)
            .cloned()
            .collect()
    }

    pub fn acknowledge_warning(&self, id: &str) -> bool {
        let mut warnings = self.warnings.write();
        if let Some(warning) = warnings.get_mut(id) {
            warning.acknowledged = true;
            warning.acknowledged_at = Some(Utc::now());
            true
        } else {
            false
        }
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.read().len()
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.warnings
            .read()
            .values()
            .filter(|w| !w.acknowledged)
            .count()
    }

    pub fn critical_count(&self) -> usize {
        self.warnings
            .read()
            .values()
            .filter(|w| w.severity == WarningSeverity::Critical && !w.acknowledged)
            .count()
    }

    /// Periodic maintenance: auto-acknowledge stale warnings, drop old ones.
    pub fn cleanup(&self) {
        let auto_ack_minutes = self.config.auto_acknowledge_hours * 60;
        let max_age_minutes = self.config.max_warning_age_hours * 60;

        let mut warnings = self.warnings.write();
        let now = Utc::now();

        for warning in warnings.values_mut() {
            if !warning.acknowledged && warning.age_minutes() > auto_ack_minutes {
                warning.acknowledged = true;
                warning.acknowledged_at = Some(now);
            }
        }

        let before = warnings.len();
        warnings.retain(|_, w| w.age_minutes() <= max_age_minutes);
        let removed = before - warnings.len();
        if removed > 0 {
            info!(removed = removed, "Dropped expired warnings");
        }
    }

    fn evict_oldest(warnings: &mut HashMap<String, Warning>) {
        // Drop the oldest 10% when at capacity
        let to_remove = (warnings.len() / 10).max(1);

        let mut sorted: Vec<_> = warnings
            .iter()
            .map(|(id, w)| (id.clone(), w.created_at))
            .collect();
        sorted.sort_by_key(|(_, created_at)| *created_at);

        for (id, _) in sorted.into_iter().take(to_remove) {
            warnings.remove(&id);
        }
    }
}

impl Default for WarningService {
    fn default() -> Self {
        Self::new(WarningServiceConfig::default())
    }
}
