//! Traits the task adapters call into, plus the HTTP fetcher.

use async_trait::async_trait;
use std::time::Duration;
use tasklane_core::TaskError;
use thiserror::Error;
use tracing::{instrument, trace};

use crate::optimizer::Category;

/// Errors raised by collaborators.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Invalid input: {0}")]
    Invalid(String),
}

impl From<CollaboratorError> for TaskError {
    fn from(e: CollaboratorError) -> Self {
        TaskError::Collaborator(e.to_string())
    }
}

/// Read side of the page cache.
#[async_trait]
pub trait PageCache: Send + Sync + 'static {
    /// True when a cached copy of `url` exists and has not expired.
    async fn is_fresh(&self, url: &str) -> Result<bool, CollaboratorError>;
}

/// Write side of the page cache. Every purge must be idempotent.
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    async fn flush_all(&self) -> Result<(), CollaboratorError>;
    async fn purge_directory(&self, path: &str) -> Result<(), CollaboratorError>;
    async fn purge_url(&self, url: &str) -> Result<(), CollaboratorError>;
    async fn purge_language(&self, code: &str) -> Result<(), CollaboratorError>;
}

/// Issues the warm-up request for one URL.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn get(&self, url: &str, user_agent: &str) -> Result<(), CollaboratorError>;
}

/// Paged list of the site's public URLs: home, taxonomies, permalinks.
#[async_trait]
pub trait SiteMap: Send + Sync + 'static {
    async fn total(&self) -> Result<usize, CollaboratorError>;
    async fn page(&self, offset: usize, limit: usize) -> Result<Vec<String>, CollaboratorError>;
}

/// Database operations behind the optimizer.
///
/// Rows are opaque identifiers; for [`Category::TableFragmentation`] they are table names.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    async fn count(&self, category: Category) -> Result<usize, CollaboratorError>;
    async fn fetch(&self, category: Category) -> Result<Vec<String>, CollaboratorError>;
    async fn delete(&self, category: Category, row: &str) -> Result<(), CollaboratorError>;
    async fn optimize_table(&self, table: &str) -> Result<(), CollaboratorError>;
}

/// Fetcher backed by a shared reqwest client. Non-success statuses count as failures.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// A fetcher with its own client and a per-request `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::Http(e.to_string()))?;
        Ok(Self { client })
    }

    /// A fetcher sharing an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self), level = "trace")]
    async fn get(&self, url: &str, user_agent: &str) -> Result<(), CollaboratorError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, user_agent)
            .send()
            .await
            .map_err(|e| CollaboratorError::Http(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CollaboratorError::Http(format!("{url} returned {status}")));
        }
        trace!(%status, "Fetched");
        Ok(())
    }
}
