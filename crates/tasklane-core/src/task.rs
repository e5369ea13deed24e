//! The per-item callback a queue is processed with.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

use crate::error::TaskError;

/// What to do with an item after it has been handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<I> {
    /// The item is finished and is dropped from its batch.
    Done,
    /// Keep this (possibly updated) item at the same position for a later cycle.
    Retry(I),
}

/// A task adapter plugged into the batch processor.
///
/// Implementations only see one item at a time; queueing, locking and budgets are handled by
/// the processor.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    type Item: Serialize + DeserializeOwned + Debug + Send + Sync + 'static;

    /// Process one item.
    async fn handle(&self, item: Self::Item) -> Result<Outcome<Self::Item>, TaskError>;

    /// Names of the configuration toggles that feed this task.
    fn supported_options(&self) -> &'static [&'static str] {
        &[]
    }

    /// Called once when a run has drained the whole queue.
    async fn on_complete(&self, _action: &str) {}

    /// Items to enqueue when the task wants to restart on its own, checked by the health sweep.
    async fn due_restart(&self) -> Option<Vec<Self::Item>> {
        None
    }

    /// Called once the items from [`Task::due_restart`] are saved. Clear the schedule here.
    async fn restart_enqueued(&self) {}
}
