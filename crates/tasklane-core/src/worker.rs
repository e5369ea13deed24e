//! In-process worker pool draining a [`LocalDispatcher`] channel.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::dispatch::{Dispatcher, LocalDispatcher, WorkReceiver};
use crate::engine::Engine;
use crate::job::Registry;

impl Engine<LocalDispatcher> {
    /// Build an engine dispatching over a local channel sized by `config`.
    /// The receiver goes to a [`WorkerPool`].
    pub fn local(registry: Registry, config: EngineConfig) -> (Self, WorkReceiver) {
        let (dispatcher, receiver) = LocalDispatcher::channel(config.channel_capacity);
        (Engine::new(registry, dispatcher).with_config(config), receiver)
    }
}

/// A fixed set of tokio tasks, each running [`Engine::handle`] for requests it receives.
pub struct WorkerPool<D> {
    engine: Arc<Engine<D>>,
    receiver: Arc<Mutex<WorkReceiver>>,
    num_workers: usize,
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl<D: Dispatcher> WorkerPool<D> {
    /// A pool of at least one worker. Nothing runs until [`WorkerPool::start`].
    pub fn new(engine: Arc<Engine<D>>, receiver: WorkReceiver, num_workers: usize) -> Self {
        Self {
            engine,
            receiver: Arc::new(Mutex::new(receiver)),
            num_workers: num_workers.max(1),
            handles: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine<D>> {
        &self.engine
    }

    /// Start all workers. Each worker runs in its own async task.
    pub fn start(&mut self) {
        for worker_id in 0..self.num_workers {
            let engine = self.engine.clone();
            let receiver = self.receiver.clone();
            let token = self.cancel.child_token();
            let handle = tokio::spawn(async move {
                debug!(worker_id, "Worker started");
                loop {
                    let request = tokio::select! {
                        _ = token.cancelled() => None,
                        request = async { receiver.lock().await.0.recv().await } => request,
                    };
                    let Some(request) = request else {
                        break;
                    };
                    if let Err(e) = engine.handle(request).await {
                        warn!(worker_id, error = %e, "Cycle failed");
                    }
                }
                debug!(worker_id, "Worker stopped");
            });
            self.handles.push(handle);
        }
        info!(workers = self.num_workers, "Worker pool started");
    }

    /// Signal all workers to stop after their current cycle.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for all workers to finish.
    pub async fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
    }

    /// Stop and wait.
    pub async fn shutdown(mut self) {
        self.stop();
        self.join().await;
    }
}
