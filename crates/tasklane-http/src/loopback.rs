//! Dispatch by posting to our own worker endpoint.

use async_trait::async_trait;
use tasklane_core::{DispatchError, Dispatcher, WorkRequest};
use tracing::{trace, warn};

use crate::config::HttpConfig;
use crate::nonce::sign;
use crate::server::WorkerBody;

/// Posts signed work requests to the worker endpoint without waiting for the outcome.
///
/// The post runs on a spawned task; a failure is only logged and the health check picks the
/// queue up later.
#[derive(Clone)]
pub struct LoopbackDispatcher {
    client: reqwest::Client,
    config: HttpConfig,
}

impl LoopbackDispatcher {
    /// Build the HTTP client for `config`.
    pub fn new(config: HttpConfig) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DispatchError::Other(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn body(&self, request: WorkRequest) -> WorkerBody {
        WorkerBody {
            nonce: sign(&self.config.secret, &request.action),
            action: request.action,
            lease: request.lease,
        }
    }
}

#[async_trait]
impl Dispatcher for LoopbackDispatcher {
    async fn dispatch(&self, request: WorkRequest) -> Result<(), DispatchError> {
        let body = self.body(request);
        let post = self.client.post(&self.config.endpoint).json(&body);
        tokio::spawn(async move {
            match post.send().await {
                Ok(response) if response.status().is_success() => {
                    trace!(action = %body.action, "Loopback accepted");
                }
                Ok(response) => {
                    warn!(action = %body.action, status = %response.status(), "Loopback rejected");
                }
                Err(e) => warn!(action = %body.action, error = %e, "Loopback post failed"),
            }
        });
        Ok(())
    }
}
