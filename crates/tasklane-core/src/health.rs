//! Periodic sweep that re-dispatches stalled queues.
//!
//! A queue stalls when its dispatch was lost or its worker died: batches remain but nobody
//! holds a live lease. Each tick calls [`Engine::sweep`], which also enqueues scheduled restarts.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dispatch::Dispatcher;
use crate::engine::Engine;

/// Periodic re-dispatch of stalled queues.
pub struct HealthCheck<D> {
    engine: Arc<Engine<D>>,
    interval: Duration,
}

/// Handle to a running health check.
pub struct HealthCheckHandle {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl HealthCheckHandle {
    /// Cancel the sweep loop and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

impl<D: Dispatcher> HealthCheck<D> {
    /// A health check ticking at the engine's configured interval.
    pub fn new(engine: Arc<Engine<D>>) -> Self {
        let interval = engine.config().health_interval;
        Self { engine, interval }
    }

    /// Override the tick interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one sweep now.
    pub async fn sweep_once(&self) -> Vec<String> {
        self.engine.sweep().await
    }

    /// Spawn the periodic sweep. The first tick fires immediately.
    pub fn spawn(self) -> HealthCheckHandle {
        let cancel = CancellationToken::new();
        let token = cancel.child_token();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks = IntervalStream::new(ticker);
            info!(interval = ?self.interval, "Health check started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    tick = ticks.next() => {
                        if tick.is_none() {
                            break;
                        }
                        let dispatched = self.sweep_once().await;
                        debug!(?dispatched, "Health check sweep finished");
                    }
                }
            }
            info!("Health check stopped");
        });
        HealthCheckHandle { handle, cancel }
    }
}
