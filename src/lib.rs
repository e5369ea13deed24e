//! # Tasklane - budgeted background jobs over persisted batch queues
//!
//! Long jobs (cache preloading, cache purging, database cleanup) run as a chain of short
//! cycles. Each cycle drains a persisted per-action queue under a single-flight lease, stops
//! at a time or memory ceiling and hands off to a fresh invocation of itself.
//!
//! ## Features
//!
//! - Core functionality is always included
//! - `redis`: Redis-backed queue, lock and state stores
//! - `tasks`: preloader, purger and database optimizer adapters
//! - `http`: signed worker endpoint and loopback dispatcher
//! - `full`: Enables all features
//!
//! ```toml
//! [dependencies]
//! tasklane = { version = "0.3.0", features = ["redis", "tasks"] }
//! ```

/// Install a `tracing` fmt subscriber.
pub fn init() {
    tracing_subscriber::fmt::init();
}

pub use tasklane_core as core;

#[cfg(feature = "redis")]
pub use tasklane_redis as redis;

#[cfg(feature = "tasks")]
pub use tasklane_tasks as tasks;

#[cfg(feature = "http")]
pub use tasklane_http as http;

pub use tasklane_core::{
    Budget, Engine, EngineConfig, EngineError, HealthCheck, Job, Outcome, Queue, Registry, Task,
    WorkRequest, WorkerPool,
};
