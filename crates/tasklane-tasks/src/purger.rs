//! Cache purging.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tasklane_core::{Outcome, Task, TaskError};
use tracing::{info, instrument};

use crate::collaborators::CacheBackend;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PurgeItem {
    /// Empty the whole cache.
    FlushAll,
    /// Remove a directory, relative to the cache root, with everything below it.
    Directory { path: String },
    /// Remove the cached copies of these pages only.
    Urls { urls: Vec<String> },
    /// Remove every page of one language.
    Language { code: String },
}

/// Task that removes cached pages through a [`CacheBackend`].
pub struct Purger<B> {
    backend: Arc<B>,
}

impl<B: CacheBackend> Purger<B> {
    /// A purger working on `backend`.
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B: CacheBackend> Task for Purger<B> {
    type Item = PurgeItem;

    #[instrument(skip(self), level = "debug")]
    async fn handle(&self, item: PurgeItem) -> Result<Outcome<PurgeItem>, TaskError> {
        match item {
            PurgeItem::FlushAll => self.backend.flush_all().await?,
            PurgeItem::Directory { path } => self.backend.purge_directory(&path).await?,
            PurgeItem::Urls { urls } => {
                for url in &urls {
                    self.backend.purge_url(url).await?;
                }
            }
            PurgeItem::Language { code } => self.backend.purge_language(&code).await?,
        }
        Ok(Outcome::Done)
    }

    fn supported_options(&self) -> &'static [&'static str] {
        &["enable_page_caching", "purge_on_update"]
    }

    async fn on_complete(&self, action: &str) {
        info!(action, "Purge finished");
    }
}
