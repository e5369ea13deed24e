use thiserror::Error;

/// Errors that can occur in a QueueStore implementation.
#[derive(Debug, Error)]
pub enum QueueStoreError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Batch not found: {0}")]
    BatchNotFound(String),
    #[error("Other error: {0}")]
    Other(String),
}

/// Errors that can occur in a LockManager implementation.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Other error: {0}")]
    Other(String),
}

/// Errors that can occur in a StateStore implementation.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Other error: {0}")]
    Other(String),
}

/// Errors raised while handing a work request to a worker.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Dispatcher is closed")]
    Closed,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Other error: {0}")]
    Other(String),
}

/// A failure while processing a single queue item.
///
/// Item failures are logged and the item is dropped; they never abort a cycle.
#[derive(Debug, Error, Clone)]
pub enum TaskError {
    #[error("Item could not be decoded: {0}")]
    Decode(String),
    #[error("Collaborator error: {0}")]
    Collaborator(String),
    #[error("Task error: {0}")]
    Generic(String),
}

impl From<StateStoreError> for TaskError {
    fn from(e: StateStoreError) -> Self {
        TaskError::Collaborator(e.to_string())
    }
}

/// Top level error for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("Queue store error: {0}")]
    Queue(#[from] QueueStoreError),
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
    #[error("State store error: {0}")]
    State(#[from] StateStoreError),
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
