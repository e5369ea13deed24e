//! Redis connection settings.

use std::time::Duration;

/// Configuration for the Redis connection shared by the tasklane stores.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://127.0.0.1:6379/")
    pub url: String,
    /// Optional username for ACL authentication.
    pub username: Option<String>,
    /// Optional password.
    pub password: Option<String>,
    /// Timeout for establishing the connection.
    pub connection_timeout: Duration,
    /// Prefix for every key so several deployments can share one Redis.
    pub key_prefix: String,
}

impl RedisConfig {
    /// Create a configuration for `url` with a 5 second connect timeout and the `tasklane:` prefix.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            connection_timeout: Duration::from_secs(5),
            key_prefix: "tasklane:".to_string(),
        }
    }

    /// Set the username.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// The connection URL with scheme, credentials and trailing slash filled in.
    pub(crate) fn build_connection_url(&self) -> String {
        let (scheme, rest) = match self.url.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("redis", self.url.as_str()),
        };
        let credentials = match (&self.username, &self.password) {
            (_, _) if rest.contains('@') => String::new(),
            (Some(user), Some(pass)) => format!("{user}:{pass}@"),
            (None, Some(pass)) => format!(":{pass}@"),
            (Some(user), None) => format!("{user}@"),
            (None, None) => String::new(),
        };
        let mut url = format!("{scheme}://{credentials}{rest}");
        if !url.ends_with('/') {
            url.push('/');
        }
        url
    }
}
