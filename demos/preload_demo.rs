//! Preload a small site through the local worker pool.
//!
//! Run with `cargo run --example preload_demo --features tasks`.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tasklane::core::{InMemoryLockManager, InMemoryQueueStore, InMemoryStateStore, QueueStore};
use tasklane::tasks::{
    actions, CollaboratorError, Fetcher, FsPageCache, PreloadItem, Preloader, PreloaderConfig,
    SiteMap,
};
use tasklane::{Budget, Engine, EngineConfig, HealthCheck, Job, Registry, WorkerPool};
use tracing::info;

struct LoggingFetcher;

#[async_trait]
impl Fetcher for LoggingFetcher {
    async fn get(&self, url: &str, user_agent: &str) -> Result<(), CollaboratorError> {
        info!(url, user_agent, "GET");
        Ok(())
    }
}

struct DemoSiteMap;

#[async_trait]
impl SiteMap for DemoSiteMap {
    async fn total(&self) -> Result<usize, CollaboratorError> {
        Ok(12)
    }

    async fn page(&self, offset: usize, limit: usize) -> Result<Vec<String>, CollaboratorError> {
        Ok((offset..12.min(offset + limit))
            .map(|i| format!("https://example.com/post-{i}/"))
            .collect())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tasklane::init();

    let cache_dir = std::env::temp_dir().join("tasklane-demo-cache");
    let store = InMemoryQueueStore::new();
    let config = EngineConfig::default()
        .with_budget(Budget::default().with_item_limit(4))
        .with_health_interval(Duration::from_secs(2));

    let preloader = Preloader::new(
        Arc::new(FsPageCache::new(&cache_dir)),
        Arc::new(LoggingFetcher),
        Arc::new(DemoSiteMap),
        InMemoryStateStore::new(),
    )
    .with_config(
        PreloaderConfig::default()
            .with_delay(Duration::from_millis(50))
            .with_mobile(true)
            .with_urls_per_step(5),
    );
    let job = Job::new(
        actions::CACHE_PRELOADER,
        preloader,
        store.clone(),
        InMemoryLockManager::new(),
    )
    .with_config(&config);

    let (engine, receiver) = Engine::local(Registry::new().with(job), config.clone());
    let engine = Arc::new(engine);
    let mut pool = WorkerPool::new(engine.clone(), receiver, config.workers);
    pool.start();
    let health = HealthCheck::new(engine.clone()).spawn();

    engine
        .enqueue(
            actions::CACHE_PRELOADER,
            [PreloadItem::url("https://example.com/"), PreloadItem::Crawl],
        )
        .await?;

    while !store.is_empty(actions::CACHE_PRELOADER).await? {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    for status in engine.statuses().await? {
        info!(?status, "Finished");
    }

    health.stop().await;
    pool.shutdown().await;
    Ok(())
}
