mod helpers;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tasklane_core::{
    ActionRunner, Budget, CycleOutcome, Job, Outcome, Queue, QueueStore, SkipReason, Task,
    TaskError,
};
use tasklane_redis::{RedisLockManager, RedisQueueStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Page {
    url: String,
}

#[derive(Default)]
struct Collect {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Task for Collect {
    type Item = Page;

    async fn handle(&self, item: Page) -> Result<Outcome<Page>, TaskError> {
        self.seen.lock().unwrap().push(item.url);
        Ok(Outcome::Done)
    }
}

#[tokio::test]
async fn test_job_drains_redis_queue_across_cycles() {
    helpers::init_tracing();
    let mut redis = helpers::TestRedis::start().await;
    let client = redis.client().await;
    let store = RedisQueueStore::new(client.clone());
    let task = Arc::new(Collect::default());
    let job = Job::shared(
        "cache_preloader",
        task.clone(),
        store.clone(),
        RedisLockManager::new(client),
    )
    .with_budget(Budget::default().with_item_limit(2));

    let mut queue = Queue::new("cache_preloader", store.clone());
    for url in ["/a", "/b", "/c"] {
        queue.push(Page { url: url.to_string() });
    }
    queue.save().await.unwrap();

    let first = job.run_cycle(None).await.unwrap();
    let lease = first.continuation().cloned().expect("more work");
    // A redundant fresh start sees the held lock.
    assert_eq!(
        job.run_cycle(None).await.unwrap().outcome,
        CycleOutcome::Skipped(SkipReason::Locked)
    );
    let second = job.run_cycle(Some(lease)).await.unwrap();
    assert_eq!(second.outcome, CycleOutcome::Completed);

    assert_eq!(*task.seen.lock().unwrap(), vec!["/a", "/b", "/c"]);
    assert!(store.is_empty("cache_preloader").await.unwrap());
    assert!(!job.is_locked().await.unwrap());
    redis.cleanup().await;
}
