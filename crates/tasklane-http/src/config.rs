use std::time::Duration;

/// Settings shared by the worker endpoint and the loopback dispatcher.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Full URL of the worker trigger, e.g. `http://127.0.0.1:8080/worker`.
    pub endpoint: String,
    /// Shared secret the nonces are derived from.
    pub secret: String,
    /// Timeout of a loopback post. The cycle itself is never awaited.
    pub timeout: Duration,
}

impl HttpConfig {
    /// Trigger `endpoint`, signing with `secret`, with a one second timeout.
    pub fn new(endpoint: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            secret: secret.into(),
            timeout: Duration::from_secs(1),
        }
    }

    /// Override the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
