//! Distributed leader lock
//!
//! A single-holder lock over Redis used by the router's standby service.
//! At most one instance holds a given key at any time; ownership lapses
//! when the TTL expires without renewal.

pub mod error;
pub mod leader;

pub use error::{Result, StandbyError};
pub use leader::{LeaderLock, LeaderLockConfig, RedisLeaderLock};
