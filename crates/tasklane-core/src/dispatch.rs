//! Hand-off of work requests to workers.
//!
//! Dispatch is fire-and-forget: the caller never waits for the cycle it triggers. The
//! [`LocalDispatcher`] feeds an in-process [`crate::WorkerPool`] through a bounded channel;
//! other transports (such as an HTTP loopback call) implement the same [`Dispatcher`] trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::DispatchError;
use crate::lock::Lease;

/// A request to run one cycle of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Action to run a cycle for.
    pub action: String,
    /// Present when the request continues a run that already holds the lock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
}

impl WorkRequest {
    /// A fresh start: the worker must acquire the lock itself.
    pub fn start(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            lease: None,
        }
    }

    /// A continuation carrying the lease of the previous cycle.
    pub fn resume(lease: Lease) -> Self {
        Self {
            action: lease.action.clone(),
            lease: Some(lease),
        }
    }

    /// True when the request carries a lease to resume with.
    pub fn is_continuation(&self) -> bool {
        self.lease.is_some()
    }
}

/// Trait for triggering processing of a queue.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    /// Hand the request to a worker without waiting for it to run.
    async fn dispatch(&self, request: WorkRequest) -> Result<(), DispatchError>;
}

#[async_trait]
impl<D: Dispatcher> Dispatcher for Arc<D> {
    async fn dispatch(&self, request: WorkRequest) -> Result<(), DispatchError> {
        (**self).dispatch(request).await
    }
}

/// In-process dispatcher backed by a bounded channel.
#[derive(Clone)]
pub struct LocalDispatcher {
    sender: mpsc::Sender<WorkRequest>,
}

/// Receiving end of a [`LocalDispatcher`], consumed by a worker pool.
pub struct WorkReceiver(pub(crate) mpsc::Receiver<WorkRequest>);

impl LocalDispatcher {
    /// A bounded channel; the receiver feeds a worker pool.
    pub fn channel(capacity: usize) -> (Self, WorkReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, WorkReceiver(receiver))
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn dispatch(&self, request: WorkRequest) -> Result<(), DispatchError> {
        trace!(action = %request.action, resume = request.is_continuation(), "Dispatching locally");
        self.sender.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                DispatchError::Transport("worker channel is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records requests instead of running them.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingDispatcher {
        pub requests: Arc<Mutex<Vec<WorkRequest>>>,
        pub fail: Arc<std::sync::atomic::AtomicBool>,
    }

    impl RecordingDispatcher {
        pub(crate) fn take(&self) -> Vec<WorkRequest> {
            std::mem::take(&mut *self.requests.lock().unwrap())
        }
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn dispatch(&self, request: WorkRequest) -> Result<(), DispatchError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(DispatchError::Transport("unreachable".into()));
            }
            self.requests.lock().unwrap().push(request);
            Ok(())
        }
    }

    #[tokio::test]
    async fn local_dispatch_reports_a_full_channel() {
        let (dispatcher, mut receiver) = LocalDispatcher::channel(1);
        dispatcher.dispatch(WorkRequest::start("a")).await.unwrap();
        let err = dispatcher.dispatch(WorkRequest::start("b")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Transport(_)));
        assert_eq!(receiver.0.recv().await.unwrap().action, "a");

        drop(receiver);
        let err = dispatcher.dispatch(WorkRequest::start("c")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Closed));
    }

    #[test]
    fn fresh_requests_serialize_without_a_lease() {
        let json = serde_json::to_value(WorkRequest::start("cache_purger")).unwrap();
        assert_eq!(json, serde_json::json!({ "action": "cache_purger" }));
        let resumed = WorkRequest::resume(Lease::new("cache_purger"));
        assert!(resumed.is_continuation());
    }
}
