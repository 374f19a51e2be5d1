use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;

// ============================================================================
// Core Message Types
// ============================================================================

/// The routing envelope that flows end-to-end through the system.
///
/// The payload itself lives downstream; the pointer only carries enough to
/// reach the mediation target. Wire format is camelCase JSON; `batch_id` is
/// assigned internally per consumer fetch and never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePointer {
    pub id: String,
    #[serde(default)]
    pub pool_code: String,
    pub auth_token: Option<String>,
    pub mediation_type: MediationType,
    pub mediation_target: String,
    #[serde(default)]
    pub message_group_id: Option<String>,
    #[serde(skip)]
    pub batch_id: Option<String>,
}

impl MessagePointer {
    /// A pointer is routable only with a non-empty id and pool code.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && !self.pool_code.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediationType {
    HTTP,
}

// ============================================================================
// Mediation Types
// ============================================================================

/// Result of one mediation attempt. Closed set so the processor can
/// exhaustively dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediationResult {
    /// Delivered and acknowledged by the target
    Success,
    /// Logical failure (HTTP 400 or target replied `ack:false`) - retry via nack
    ErrorProcess,
    /// Server-side failure (5xx or unexpected status/response) - retry via nack
    ErrorServer,
    /// Transport failure (connect refused, timeout) - retry via nack
    ErrorConnection,
    /// Refused locally by the rate limiter; the mediator was never called
    RateLimited,
}

impl MediationResult {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, MediationResult::Success)
    }
}

/// Outcome of a mediation attempt with diagnostic context.
#[derive(Debug, Clone)]
pub struct MediationOutcome {
    pub result: MediationResult,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    /// The target accepted the request but is not ready yet (200 with
    /// `ack:false`). Redelivered via visibility without counting as a failure.
    pub deferred: bool,
}

impl MediationOutcome {
    pub fn success(status_code: u16) -> Self {
        Self {
            result: MediationResult::Success,
            status_code: Some(status_code),
            error_message: None,
            deferred: false,
        }
    }

    pub fn error_process(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            result: MediationResult::ErrorProcess,
            status_code: Some(status_code),
            error_message: Some(message.into()),
            deferred: false,
        }
    }

    pub fn error_server(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            result: MediationResult::ErrorServer,
            status_code,
            error_message: Some(message.into()),
            deferred: false,
        }
    }

    pub fn error_connection(message: impl Into<String>) -> Self {
        Self {
            result: MediationResult::ErrorConnection,
            status_code: None,
            error_message: Some(message.into()),
            deferred: false,
        }
    }

    /// Target replied 200 with `ack:false` - nack for redelivery without
    /// marking the attempt failed.
    pub fn not_ready(message: Option<String>) -> Self {
        Self {
            result: MediationResult::ErrorProcess,
            status_code: Some(200),
            error_message: message.or_else(|| Some("target replied ack=false".to_string())),
            deferred: true,
        }
    }
}

// ============================================================================
// Callback Capability
// ============================================================================

/// Broker-specific completion capability attached to each in-flight pointer.
///
/// Consumers that cannot control visibility expose only `ack`/`nack`; the
/// pool checks `supports_visibility_control` before invoking the rest.
#[async_trait]
pub trait MessageCallback: Send + Sync {
    /// Delete the message from the broker.
    async fn ack(&self, pointer: &MessagePointer);

    /// Deliberately abstain from deletion; redelivery happens through the
    /// broker's visibility mechanism.
    async fn nack(&self, pointer: &MessagePointer);

    fn supports_visibility_control(&self) -> bool {
        false
    }

    /// Re-offer the message quickly (~1s), used for rate-limited retries.
    async fn set_fast_fail_visibility(&self, _pointer: &MessagePointer) {}

    /// Restore the standard backoff interval (~30s) before redelivery.
    async fn reset_visibility_to_default(&self, _pointer: &MessagePointer) {}
}

// ============================================================================
// Configuration Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub code: String,
    pub concurrency: u32,
    pub queue_capacity: u32,
    pub rate_limit_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueType {
    #[serde(rename = "SQS")]
    Sqs,
    #[serde(rename = "ACTIVEMQ")]
    ActiveMq,
    #[serde(rename = "EMBEDDED")]
    Embedded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConsumerMode {
    #[serde(rename = "SYNC")]
    #[default]
    Sync,
    #[serde(rename = "ASYNC")]
    Async,
}

/// Per-queue configuration; unknown knobs for a broker type are ignored by
/// the corresponding client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default)]
    pub name: String,
    pub uri: String,
    pub queue_type: QueueType,
    #[serde(default = "default_connections")]
    pub connections: u32,
    #[serde(default = "default_max_messages_per_poll")]
    pub max_messages_per_poll: u32,
    #[serde(default = "default_wait_time_seconds")]
    pub wait_time_seconds: u32,
    #[serde(default)]
    pub consumer_mode: ConsumerMode,
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    #[serde(default = "default_visibility_timeout_seconds")]
    pub visibility_timeout_seconds: u32,
}

fn default_connections() -> u32 {
    1
}

fn default_max_messages_per_poll() -> u32 {
    10
}

fn default_wait_time_seconds() -> u32 {
    20
}

fn default_receive_timeout_ms() -> u64 {
    1000
}

fn default_visibility_timeout_seconds() -> u32 {
    30
}

impl QueueSettings {
    /// Stable identifier for registries and logs; name when set, uri otherwise.
    pub fn identifier(&self) -> &str {
        if self.name.is_empty() {
            &self.uri
        } else {
            &self.name
        }
    }
}

/// The router-relevant configuration slice: the pools and queues to run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterTopology {
    pub pools: Vec<PoolConfig>,
    pub queues: Vec<QueueSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandbySettings {
    pub enabled: bool,
    pub instance_id: String,
    pub lock_key: String,
    pub lock_ttl_seconds: u64,
    pub refresh_interval_seconds: u64,
}

impl Default for StandbySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            instance_id: String::new(),
            lock_key: "relay:router:leader".to_string(),
            lock_ttl_seconds: 30,
            refresh_interval_seconds: 10,
        }
    }
}

// ============================================================================
// Warning System Types
// ============================================================================

/// What happened; every kind the core emits appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WarningKind {
    /// Pointer referenced a pool code with no registered pool
    UnknownPool,
    /// Pool buffer was full at admission
    QueueFull,
    /// Message body failed to parse; acked to drop
    PoisonMessage,
    /// Pool count reached the configured limit or threshold
    PoolLimit,
    /// Consumer stalled or failed to start
    ConsumerHealth,
    /// Broker unreachable or fetch errors
    QueueConnectivity,
    /// Configuration load or reconcile problem
    Configuration,
    /// Memory or resource pressure
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WarningSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub id: String,
    pub kind: WarningKind,
    pub severity: WarningSeverity,
    pub message: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Warning {
    pub fn new(
        kind: WarningKind,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            severity,
            message,
            source,
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.created_at).num_minutes()
    }
}

// ============================================================================
// Health & Stats Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub pools_healthy: u32,
    pub pools_unhealthy: u32,
    pub consumers_healthy: u32,
    pub consumers_unhealthy: u32,
    pub active_warnings: u32,
    pub critical_warnings: u32,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerHealth {
    pub queue_identifier: String,
    pub is_running: bool,
    pub is_healthy: bool,
    pub seconds_since_heartbeat: Option<u64>,
}

/// Monotonic per-pool counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PoolCounters {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rate_limited: u64,
}

/// Processing-time distribution over retained samples.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingTimeStats {
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub sample_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_code: String,
    pub concurrency: u32,
    pub queue_capacity: u32,
    pub active_workers: u32,
    pub available_permits: u32,
    pub buffer_size: u32,
    pub active_groups: u32,
    pub rate_limit_per_minute: Option<u32>,
    pub counters: PoolCounters,
    pub processing_time: ProcessingTimeStats,
}
