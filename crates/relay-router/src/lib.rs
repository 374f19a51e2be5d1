//! Relay message router core
//!
//! - QueueManager: global fan-in, dedup pipeline and pool registry
//! - ProcessPool: bounded dispatcher with per-group FIFO and rate limiting
//! - HttpMediator: one HTTP delivery attempt per pointer
//! - QueueConsumer: per-queue fetch driver (sync and async modes)
//! - StandbyService: primary/standby gating via a distributed leader lock
//! - WarningService / HealthService: operational monitoring
//! - LifecycleManager: background maintenance tasks
//! - ConfigSyncService: file-driven incremental reconcile

pub mod config_sync;
pub mod consumer;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod manager;
pub mod mediator;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod rate_limit;
pub mod router_metrics;
pub mod standby;
pub mod warning;

pub use config_sync::{spawn_config_sync_task, ConfigSyncConfig, ConfigSyncResult, ConfigSyncService};
pub use consumer::{ConsumerSettings, QueueConsumer};
pub use error::RouterError;
pub use health::{HealthService, HealthServiceConfig};
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use manager::{ConsumerFactory, MessageRouter, QueueManager};
pub use mediator::{HttpMediator, HttpMediatorConfig, Mediator};
pub use metrics::{MetricsConfig, PoolMetricsCollector};
pub use pipeline::PipelineRegistry;
pub use pool::{BatchGroupKey, PoolState, ProcessPool, DEFAULT_DRAIN_TIMEOUT};
pub use rate_limit::RateLimiterRegistry;
pub use standby::{StandbyListener, StandbyService, StandbyState};
pub use warning::{WarningService, WarningServiceConfig};

pub type Result<T> = std::result::Result<T, RouterError>;
