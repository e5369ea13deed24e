//! Registered actions.
//!
//! A [`Job`] binds an action name to its task, queue store and lock manager. The [`Registry`]
//! holds every job behind the object-safe [`ActionRunner`] trait so the engine, the worker pool
//! and the HTTP endpoint can drive any action by name.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::budget::{Budget, MemoryProbe};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::lock::{Lease, LockManager};
use crate::processor::{BatchProcessor, CycleReport};
use crate::queue::{BatchToken, Queue, QueueStore};
use crate::task::Task;

/// Derived process state: running iff a live lease exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessStatus {
    Idle,
    Running { since: DateTime<Utc> },
}

/// Snapshot of one action's queue and lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Registered action name.
    pub action: String,
    /// Whether a cycle currently holds the lock.
    pub process: ProcessStatus,
    /// Batches waiting.
    pub batches: usize,
    /// Items across all waiting batches.
    pub pending_items: usize,
}

/// Object-safe view of a registered job.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    fn action(&self) -> &str;

    fn supported_options(&self) -> &'static [&'static str];

    /// Run one processing cycle.
    async fn run_cycle(&self, lease: Option<Lease>) -> Result<CycleReport, EngineError>;

    /// Validate and persist raw items as one batch.
    async fn enqueue(&self, items: Vec<Value>) -> Result<Option<BatchToken>, EngineError>;

    async fn is_empty(&self) -> Result<bool, EngineError>;

    async fn is_locked(&self) -> Result<bool, EngineError>;

    async fn status(&self) -> Result<QueueStatus, EngineError>;

    /// Remove queued work in at most `max_attempts` passes and release the lock.
    /// Returns the number of passes made.
    async fn cancel(&self, max_attempts: usize) -> Result<usize, EngineError>;

    /// Enqueue the task's restart items if it asks for a restart. Returns the new batch, if any.
    async fn restart_if_due(&self) -> Result<Option<BatchToken>, EngineError>;

    /// Release the lock without touching the queue, if it still carries `lease`.
    async fn release_lock(&self, lease: &Lease) -> Result<bool, EngineError>;
}

/// A task bound to its action name and backing stores.
pub struct Job<T, Q, L> {
    processor: BatchProcessor<T, Q, L>,
}

impl<T, Q, L> Job<T, Q, L>
where
    T: Task,
    Q: QueueStore,
    L: LockManager,
{
    /// Bind `task` to `action` with the default budget and lock TTL.
    pub fn new(action: impl Into<String>, task: T, store: Q, locks: L) -> Self {
        Self::shared(action, Arc::new(task), store, locks)
    }

    /// Build a job around a task the caller keeps a handle to.
    pub fn shared(action: impl Into<String>, task: Arc<T>, store: Q, locks: L) -> Self {
        Self {
            processor: BatchProcessor::new(action, task, store, locks),
        }
    }

    /// Apply the lock TTL and cycle budget of an engine configuration.
    pub fn with_config(self, config: &EngineConfig) -> Self {
        self.with_budget(config.budget.clone())
            .with_lock_ttl(config.lock_ttl)
    }

    /// Override the per-cycle budget.
    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.processor = self.processor.with_budget(budget);
        self
    }

    /// Override the lock TTL.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.processor = self.processor.with_lock_ttl(ttl);
        self
    }

    /// Replace the memory probe used for the budget check.
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.processor = self.processor.with_memory_probe(probe);
        self
    }

    pub fn task(&self) -> &Arc<T> {
        self.processor.task()
    }

    /// A typed producer handle for this job's queue.
    pub fn queue(&self) -> Queue<T::Item, Q> {
        Queue::new(self.processor.action(), self.processor.store().clone())
    }

    fn action_name(&self) -> &str {
        self.processor.action()
    }
}

#[async_trait]
impl<T, Q, L> ActionRunner for Job<T, Q, L>
where
    T: Task,
    Q: QueueStore,
    L: LockManager,
{
    fn action(&self) -> &str {
        self.action_name()
    }

    fn supported_options(&self) -> &'static [&'static str] {
        self.processor.task().supported_options()
    }

    async fn run_cycle(&self, lease: Option<Lease>) -> Result<CycleReport, EngineError> {
        self.processor.run_cycle(lease).await
    }

    #[instrument(skip(self, items), fields(action = %self.action_name(), items = items.len()))]
    async fn enqueue(&self, items: Vec<Value>) -> Result<Option<BatchToken>, EngineError> {
        let mut queue = self.queue();
        for raw in items {
            let item: T::Item = serde_json::from_value(raw)?;
            queue.push(item);
        }
        Ok(queue.save().await?)
    }

    async fn is_empty(&self) -> Result<bool, EngineError> {
        Ok(self.processor.store().is_empty(self.action_name()).await?)
    }

    async fn is_locked(&self) -> Result<bool, EngineError> {
        Ok(self
            .processor
            .locks()
            .is_locked(self.action_name(), self.processor.lock_ttl())
            .await?)
    }

    async fn status(&self) -> Result<QueueStatus, EngineError> {
        let action = self.action_name();
        let store = self.processor.store();
        let ttl = self.processor.lock_ttl();
        let process = match self.processor.locks().current(action).await? {
            Some(lease) if !lease.is_expired(ttl) => ProcessStatus::Running {
                since: lease.acquired_at,
            },
            _ => ProcessStatus::Idle,
        };
        Ok(QueueStatus {
            action: action.to_string(),
            process,
            batches: store.batch_count(action).await?,
            pending_items: store.pending_items(action).await?,
        })
    }

    #[instrument(skip(self), fields(action = %self.action_name()))]
    async fn cancel(&self, max_attempts: usize) -> Result<usize, EngineError> {
        let action = self.action_name();
        let store = self.processor.store();
        let mut attempts = 0;
        while attempts < max_attempts.max(1) {
            attempts += 1;
            store.clear(action).await?;
            if store.is_empty(action).await? {
                break;
            }
            debug!(attempts, "Batches still present after clear, retrying");
        }
        if !store.is_empty(action).await? {
            warn!(attempts, "Queue not empty after cancellation attempts");
        }
        self.processor.locks().release(action).await?;
        info!(attempts, "Job cancelled");
        Ok(attempts)
    }

    async fn restart_if_due(&self) -> Result<Option<BatchToken>, EngineError> {
        let Some(items) = self.processor.task().due_restart().await else {
            return Ok(None);
        };
        let mut queue = self.queue();
        for item in items {
            queue.push(item);
        }
        // The schedule stays set until the batch is durable.
        let token = queue.save().await?;
        self.processor.task().restart_enqueued().await;
        if token.is_some() {
            info!(action = %self.action_name(), "Scheduled restart enqueued");
        }
        Ok(token)
    }

    async fn release_lock(&self, lease: &Lease) -> Result<bool, EngineError> {
        Ok(self.processor.locks().release_owned(lease).await?)
    }
}

/// Explicit registry of actions, injected wherever jobs are driven.
#[derive(Clone, Default)]
pub struct Registry {
    runners: BTreeMap<String, Arc<dyn ActionRunner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner, replacing any previous one with the same action name.
    pub fn register(&mut self, runner: impl ActionRunner + 'static) -> &mut Self {
        self.runners
            .insert(runner.action().to_string(), Arc::new(runner));
        self
    }

    /// Builder form of [`Registry::register`].
    pub fn with(mut self, runner: impl ActionRunner + 'static) -> Self {
        self.register(runner);
        self
    }

    /// The runner registered under `action`.
    pub fn get(&self, action: &str) -> Option<&Arc<dyn ActionRunner>> {
        self.runners.get(action)
    }

    /// Registered action names, sorted.
    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.runners.keys().map(String::as_str)
    }

    /// Registered runners, sorted by action name.
    pub fn runners(&self) -> impl Iterator<Item = &Arc<dyn ActionRunner>> {
        self.runners.values()
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}
