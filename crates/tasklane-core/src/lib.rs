//! Core of tasklane: persisted per-action batch queues drained by short, budgeted cycles.
//!
//! A producer pushes items through a [`Queue`] and saves them as one batch. The [`Engine`]
//! dispatches a [`WorkRequest`]; a worker runs one [`BatchProcessor`] cycle under an
//! exclusive [`Lease`], and re-dispatches itself while work remains.

pub mod budget;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod health;
pub mod job;
pub mod lock;
pub mod processor;
pub mod queue;
pub mod state;
pub mod task;
pub mod worker;

pub use budget::{Budget, MemoryProbe, MemoryUsage, StopReason, SystemMemoryProbe};
pub use config::EngineConfig;
pub use dispatch::{Dispatcher, LocalDispatcher, WorkReceiver, WorkRequest};
pub use engine::Engine;
pub use error::{
    DispatchError, EngineError, LockError, QueueStoreError, StateStoreError, TaskError,
};
pub use health::{HealthCheck, HealthCheckHandle};
pub use job::{ActionRunner, Job, ProcessStatus, QueueStatus, Registry};
pub use lock::{InMemoryLockManager, Lease, LockManager};
pub use processor::{BatchProcessor, CycleOutcome, CycleReport, CycleStats, SkipReason};
pub use queue::{Batch, BatchToken, InMemoryQueueStore, Queue, QueueStore};
pub use state::{InMemoryStateStore, StateStore};
pub use task::{Outcome, Task};
pub use worker::WorkerPool;
