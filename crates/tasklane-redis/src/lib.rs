//! Redis backend for tasklane.
//!
//! - `RedisQueueStore`: per-action batch queues
//! - `RedisLockManager`: TTL leases with compare-on-token refresh
//! - `RedisStateStore`: JSON values for task progress

mod client;
mod config;
mod lock_manager;
mod queue_store;
mod state_store;

pub use client::{RedisClient, RedisClientError};
pub use config::RedisConfig;
pub use lock_manager::RedisLockManager;
pub use queue_store::RedisQueueStore;
pub use state_store::RedisStateStore;
