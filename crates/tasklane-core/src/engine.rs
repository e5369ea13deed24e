//! The engine ties the registry of jobs to a dispatcher.
//!
//! Producers call [`Engine::enqueue`]; workers call [`Engine::handle`] for every
//! [`WorkRequest`] they receive; the health check calls [`Engine::sweep`].

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::dispatch::{Dispatcher, WorkRequest};
use crate::error::EngineError;
use crate::job::{ActionRunner, QueueStatus, Registry};
use crate::processor::CycleReport;
use crate::queue::BatchToken;

/// Entry point for producers, workers and the health check.
pub struct Engine<D> {
    registry: Registry,
    dispatcher: D,
    config: EngineConfig,
}

impl<D: Dispatcher> Engine<D> {
    /// An engine with the default configuration.
    pub fn new(registry: Registry, dispatcher: D) -> Self {
        Self {
            registry,
            dispatcher,
            config: EngineConfig::default(),
        }
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn runner(&self, action: &str) -> Result<&Arc<dyn ActionRunner>, EngineError> {
        self.registry
            .get(action)
            .ok_or_else(|| EngineError::UnknownAction(action.to_string()))
    }

    /// Push `items` as one batch and trigger processing.
    ///
    /// The batch is durable once this returns `Ok`. A failed dispatch is only logged: the
    /// health sweep picks the queue up later.
    #[instrument(skip(self, items))]
    pub async fn enqueue<I, It>(
        &self,
        action: &str,
        items: It,
    ) -> Result<Option<BatchToken>, EngineError>
    where
        I: Serialize,
        It: IntoIterator<Item = I>,
    {
        let runner = self.runner(action)?;
        let items = items
            .into_iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        let token = runner.enqueue(items).await?;
        if token.is_some() {
            self.dispatch(action).await?;
        }
        Ok(token)
    }

    /// Trigger a fresh cycle for `action`. Transport failures are logged, not returned.
    pub async fn dispatch(&self, action: &str) -> Result<(), EngineError> {
        self.runner(action)?;
        if let Err(e) = self.dispatcher.dispatch(WorkRequest::start(action)).await {
            warn!(action, error = %e, "Dispatch failed, leaving the queue for the health check");
        }
        Ok(())
    }

    /// Run the cycle a worker was asked for and hand off to the next invocation if work remains.
    #[instrument(
        skip(self, request),
        fields(action = %request.action, resume = request.is_continuation())
    )]
    pub async fn handle(&self, request: WorkRequest) -> Result<CycleReport, EngineError> {
        let runner = self.runner(&request.action)?;
        let report = runner.run_cycle(request.lease).await?;
        if let Some(lease) = report.continuation() {
            debug!(stats = ?report.stats, "Handing off to a fresh cycle");
            if let Err(e) = self.dispatcher.dispatch(WorkRequest::resume(lease.clone())).await {
                // Without a continuation nobody will renew the lease; free it for the sweep.
                error!(error = %e, "Continuation dispatch failed, releasing lock");
                if let Err(e) = runner.release_lock(lease).await {
                    warn!(error = %e, "Failed to release lock");
                }
            }
        }
        Ok(report)
    }

    /// Remove all queued work for `action` and release its lock.
    ///
    /// An in-flight cycle stops after its current item: it no longer owns the lock, so it
    /// neither writes back its copy of the batch nor fires the completion hook.
    pub async fn cancel(&self, action: &str, max_attempts: usize) -> Result<usize, EngineError> {
        self.runner(action)?.cancel(max_attempts).await
    }

    /// [`Engine::cancel`] with the configured attempt cap, for a feature switched off mid-run.
    pub async fn stop(&self, action: &str) -> Result<usize, EngineError> {
        self.cancel(action, self.config.cancel_attempts).await
    }

    /// Queue and lock snapshot for one action.
    pub async fn status(&self, action: &str) -> Result<QueueStatus, EngineError> {
        self.runner(action)?.status().await
    }

    /// Snapshots for every registered action, in name order.
    pub async fn statuses(&self) -> Result<Vec<QueueStatus>, EngineError> {
        let mut statuses = Vec::with_capacity(self.registry.len());
        for runner in self.registry.runners() {
            statuses.push(runner.status().await?);
        }
        Ok(statuses)
    }

    /// One health check pass.
    ///
    /// Enqueues due restarts, then dispatches every action whose queue is non-empty but
    /// unlocked. Returns the actions dispatched. Errors for one action never stop the sweep.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Vec<String> {
        let mut dispatched = Vec::new();
        for runner in self.registry.runners() {
            let action = runner.action();
            if let Err(e) = runner.restart_if_due().await {
                warn!(action, error = %e, "Restart check failed");
            }
            let stalled = match (runner.is_empty().await, runner.is_locked().await) {
                (Ok(empty), Ok(locked)) => !empty && !locked,
                (Err(e), _) | (_, Err(e)) => {
                    warn!(action, error = %e, "Health check could not read queue state");
                    continue;
                }
            };
            if !stalled {
                continue;
            }
            match self.dispatcher.dispatch(WorkRequest::start(action)).await {
                Ok(()) => {
                    info!(action, "Re-dispatched stalled queue");
                    dispatched.push(action.to_string());
                }
                Err(e) => warn!(action, error = %e, "Health check dispatch failed"),
            }
        }
        dispatched
    }
}
