//! Engine configuration.

use std::time::Duration;

use crate::budget::Budget;

/// Configuration shared by the engine, its jobs, the worker pool and the health check.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Age after which a lock is considered abandoned.
    pub lock_ttl: Duration,
    /// Per-cycle budget applied to every job built with [`crate::Job::with_config`].
    pub budget: Budget,
    /// Interval between health check sweeps.
    pub health_interval: Duration,
    /// Circuit breaker for [`crate::Engine::stop`].
    pub cancel_attempts: usize,
    /// Number of tasks in the local worker pool.
    pub workers: usize,
    /// Capacity of the local dispatch channel.
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(10 * 60),
            budget: Budget::default(),
            health_interval: Duration::from_secs(5 * 60),
            cancel_attempts: 5,
            workers: 2,
            channel_capacity: 64,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lock TTL.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Set the per-cycle budget.
    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = budget;
        self
    }

    /// Set the health check interval.
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Set the cancellation attempt cap, at least one.
    pub fn with_cancel_attempts(mut self, attempts: usize) -> Self {
        self.cancel_attempts = attempts.max(1);
        self
    }

    /// Set the local worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the local dispatch channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}
