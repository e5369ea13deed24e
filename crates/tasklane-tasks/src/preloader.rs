//! Cache preloading.
//!
//! `Url` items warm one page: desktop first, then (with a separate mobile cache) the mobile
//! variant after the politeness delay. A `Crawl` item walks the site map one page of URLs per
//! cycle, keeping its offset in the state store, and schedules the next crawl when it is done.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tasklane_core::state::{load, save};
use tasklane_core::{Outcome, StateStore, Task, TaskError};
use tracing::{debug, info, instrument, warn};

use crate::collaborators::{Fetcher, PageCache, SiteMap};

const OFFSET_KEY: &str = "cache_preloader.offset";
const RESTART_KEY: &str = "cache_preloader.restart_at";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStage {
    #[default]
    Desktop,
    Mobile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PreloadItem {
    Url {
        url: String,
        #[serde(default)]
        stage: FetchStage,
        #[serde(default)]
        attempts: u32,
    },
    Crawl,
}

impl PreloadItem {
    /// A page to warm, starting with the desktop fetch.
    pub fn url(url: impl Into<String>) -> Self {
        PreloadItem::Url {
            url: url.into(),
            stage: FetchStage::Desktop,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreloaderConfig {
    /// Pause after each desktop fetch.
    pub delay: Duration,
    /// Warm the mobile variant too.
    pub mobile_caching: bool,
    /// Mobile pages have their own cache file and must be warmed separately.
    pub mobile_separate_cache: bool,
    /// Time between the end of a crawl and the next one. `None` disables restarts.
    pub restart_interval: Option<Duration>,
    /// Site map URLs warmed per `Crawl` step.
    pub urls_per_step: usize,
    /// Mobile fetches tried before the item is dropped.
    pub max_mobile_attempts: u32,
    /// User agent sent for the desktop fetch.
    pub desktop_user_agent: String,
    /// User agent sent for the mobile fetch.
    pub mobile_user_agent: String,
}

impl Default for PreloaderConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            mobile_caching: false,
            mobile_separate_cache: false,
            restart_interval: None,
            urls_per_step: 10,
            max_mobile_attempts: 3,
            desktop_user_agent: "tasklane-preloader".to_string(),
            mobile_user_agent:
                "tasklane-preloader (Mobile; iPhone; CPU iPhone OS like Mac OS X) Mobile"
                    .to_string(),
        }
    }
}

impl PreloaderConfig {
    /// Pause after each desktop fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Enable mobile caching, optionally with its own cache file.
    pub fn with_mobile(mut self, separate_cache: bool) -> Self {
        self.mobile_caching = true;
        self.mobile_separate_cache = separate_cache;
        self
    }

    /// Schedule a new crawl this long after one finishes.
    pub fn with_restart_interval(mut self, interval: Duration) -> Self {
        self.restart_interval = Some(interval);
        self
    }

    /// Sitemap URLs warmed per crawl item.
    pub fn with_urls_per_step(mut self, count: usize) -> Self {
        self.urls_per_step = count.max(1);
        self
    }

    /// Cap on mobile fetch attempts per page.
    pub fn with_max_mobile_attempts(mut self, attempts: u32) -> Self {
        self.max_mobile_attempts = attempts.max(1);
        self
    }

    fn warms_mobile(&self) -> bool {
        self.mobile_caching && self.mobile_separate_cache
    }
}

/// Task that warms the page cache, one URL or one crawl step per item.
pub struct Preloader<C, F, M, S> {
    cache: Arc<C>,
    fetcher: Arc<F>,
    sitemap: Arc<M>,
    state: S,
    config: PreloaderConfig,
}

impl<C, F, M, S> Preloader<C, F, M, S>
where
    C: PageCache,
    F: Fetcher,
    M: SiteMap,
    S: StateStore,
{
    /// A preloader with the default configuration.
    pub fn new(cache: Arc<C>, fetcher: Arc<F>, sitemap: Arc<M>, state: S) -> Self {
        Self {
            cache,
            fetcher,
            sitemap,
            state,
            config: PreloaderConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PreloaderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PreloaderConfig {
        &self.config
    }

    /// When the next crawl is due, if one is scheduled.
    pub async fn restart_at(&self) -> Result<Option<DateTime<Utc>>, TaskError> {
        Ok(load(&self.state, RESTART_KEY).await?)
    }

    async fn mobile(&self, url: String, attempts: u32) -> Result<Outcome<PreloadItem>, TaskError> {
        match self.fetcher.get(&url, &self.config.mobile_user_agent).await {
            Ok(()) => Ok(Outcome::Done),
            Err(e) if attempts + 1 < self.config.max_mobile_attempts => {
                warn!(%url, attempts, error = %e, "Mobile fetch failed, retrying later");
                Ok(Outcome::Retry(PreloadItem::Url {
                    url,
                    stage: FetchStage::Mobile,
                    attempts: attempts + 1,
                }))
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn warm(&self, url: String) -> Result<Outcome<PreloadItem>, TaskError> {
        if self.cache.is_fresh(&url).await? {
            debug!("Already cached");
            return Ok(Outcome::Done);
        }
        self.fetcher
            .get(&url, &self.config.desktop_user_agent)
            .await?;
        tokio::time::sleep(self.config.delay).await;
        if self.config.warms_mobile() {
            return self.mobile(url, 0).await;
        }
        Ok(Outcome::Done)
    }

    #[instrument(skip(self), level = "debug")]
    async fn crawl(&self) -> Result<Outcome<PreloadItem>, TaskError> {
        let offset: usize = load(&self.state, OFFSET_KEY).await?.unwrap_or(0);
        let total = self.sitemap.total().await?;
        let urls = self
            .sitemap
            .page(offset, self.config.urls_per_step)
            .await?;
        let fetched = urls.len();
        for url in urls {
            // A page that fails to warm is picked up by the next crawl.
            match self.warm(url.clone()).await {
                Ok(Outcome::Retry(item)) => debug!(?item, "Mobile variant left for the next crawl"),
                Ok(Outcome::Done) => {}
                Err(e) => warn!(%url, error = %e, "Crawl could not warm page"),
            }
        }

        let next = offset + fetched;
        if fetched > 0 && next < total {
            save(&self.state, OFFSET_KEY, &next).await?;
            debug!(next, total, "Crawl step finished");
            return Ok(Outcome::Retry(PreloadItem::Crawl));
        }

        self.state.delete(OFFSET_KEY).await?;
        if let Some(interval) = self.config.restart_interval {
            let interval = chrono::Duration::from_std(interval)
                .map_err(|e| TaskError::Generic(format!("restart interval out of range: {e}")))?;
            let restart_at = Utc::now() + interval;
            save(&self.state, RESTART_KEY, &restart_at).await?;
            info!(total, %restart_at, "Crawl finished, next one scheduled");
        } else {
            info!(total, "Crawl finished");
        }
        Ok(Outcome::Done)
    }
}

#[async_trait]
impl<C, F, M, S> Task for Preloader<C, F, M, S>
where
    C: PageCache,
    F: Fetcher,
    M: SiteMap,
    S: StateStore,
{
    type Item = PreloadItem;

    async fn handle(&self, item: PreloadItem) -> Result<Outcome<PreloadItem>, TaskError> {
        match item {
            PreloadItem::Url {
                url,
                stage: FetchStage::Desktop,
                ..
            } => self.warm(url).await,
            PreloadItem::Url {
                url,
                stage: FetchStage::Mobile,
                attempts,
            } => self.mobile(url, attempts).await,
            PreloadItem::Crawl => self.crawl().await,
        }
    }

    fn supported_options(&self) -> &'static [&'static str] {
        &[
            "enable_page_caching",
            "enable_mobile_caching",
            "enable_mobile_separate_cache",
            "preload_restart_interval",
        ]
    }

    async fn on_complete(&self, action: &str) {
        info!(action, "Preload finished");
    }

    async fn due_restart(&self) -> Option<Vec<PreloadItem>> {
        let restart_at = match self.restart_at().await {
            Ok(Some(at)) => at,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Could not read the preload schedule");
                return None;
            }
        };
        if Utc::now() < restart_at {
            return None;
        }
        Some(vec![PreloadItem::Crawl])
    }

    async fn restart_enqueued(&self) {
        // A crawl finishing in between may already have scheduled the next one.
        match self.restart_at().await {
            Ok(Some(at)) if at <= Utc::now() => {
                if let Err(e) = self.state.delete(RESTART_KEY).await {
                    warn!(error = %e, "Could not clear the preload schedule");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not read the preload schedule"),
        }
    }
}
