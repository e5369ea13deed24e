//! Budgeted batch execution.
//!
//! A [`BatchProcessor`] runs one cycle of an action's queue: it claims the lock, works through
//! the oldest batches item by item until the queue is drained or the [`Budget`] runs out,
//! persists what is left and reports whether the job must continue in a fresh invocation.

use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::budget::{Budget, BudgetTracker, MemoryProbe, StopReason, SystemMemoryProbe};
use crate::error::{EngineError, QueueStoreError};
use crate::lock::{Lease, LockManager};
use crate::queue::QueueStore;
use crate::task::{Outcome, Task};

/// Why a cycle did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another worker owns the action's lock.
    Locked,
    /// Nothing queued for a fresh start.
    Empty,
    /// The lease expired or was released by a cancellation, before or during the cycle.
    LeaseLost,
}

/// Result of one cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    /// Work remains; the lock is still held and must be handed to the next invocation.
    Continue {
        lease: Lease,
        reason: Option<StopReason>,
    },
    /// The queue was drained, the lock released and the completion hook fired.
    Completed,
}

/// Item counters for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Items handled to completion.
    pub processed: usize,
    /// Items kept in place for a later cycle.
    pub retried: usize,
    /// Items dropped after an error, a panic or a decode failure.
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub action: String,
    pub outcome: CycleOutcome,
    pub stats: CycleStats,
}

impl CycleReport {
    /// The lease to continue with, if the job is not finished.
    pub fn continuation(&self) -> Option<&Lease> {
        match &self.outcome {
            CycleOutcome::Continue { lease, .. } => Some(lease),
            _ => None,
        }
    }
}

/// Generic batch processor parameterized by a [`Task`] strategy.
pub struct BatchProcessor<T, Q, L> {
    action: String,
    task: Arc<T>,
    store: Q,
    locks: L,
    budget: Budget,
    lock_ttl: Duration,
    probe: Arc<dyn MemoryProbe>,
}

impl<T, Q, L> BatchProcessor<T, Q, L>
where
    T: Task,
    Q: QueueStore,
    L: LockManager,
{
    /// A processor with the default budget, a 10 minute lock TTL and the system memory probe.
    pub fn new(action: impl Into<String>, task: Arc<T>, store: Q, locks: L) -> Self {
        Self {
            action: action.into(),
            task,
            store,
            locks,
            budget: Budget::default(),
            lock_ttl: Duration::from_secs(600),
            probe: Arc::new(SystemMemoryProbe::new()),
        }
    }

    pub fn with_budget(mut self, budget: Budget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn task(&self) -> &Arc<T> {
        &self.task
    }

    pub fn store(&self) -> &Q {
        &self.store
    }

    pub fn locks(&self) -> &L {
        &self.locks
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    /// Run one cycle. `lease` is `None` for a fresh start and `Some` for a continuation.
    ///
    /// Store failures release the lock so the health sweep can restart the job.
    #[instrument(skip(self, lease), fields(action = %self.action, resume = lease.is_some()))]
    pub async fn run_cycle(&self, lease: Option<Lease>) -> Result<CycleReport, EngineError> {
        let mut stats = CycleStats::default();
        let lease = match self.claim(lease).await? {
            Ok(lease) => lease,
            Err(reason) => {
                debug!(?reason, "Cycle skipped");
                return Ok(self.report(CycleOutcome::Skipped(reason), stats));
            }
        };

        match self.drain(&lease, &mut stats).await {
            Ok(outcome) => {
                debug!(?stats, "Cycle finished");
                Ok(self.report(outcome, stats))
            }
            Err(e) => {
                error!(error = %e, "Cycle aborted, releasing lock");
                if let Err(release_err) = self.locks.release_owned(&lease).await {
                    warn!(error = %release_err, "Failed to release lock after aborted cycle");
                }
                Err(e)
            }
        }
    }

    async fn claim(&self, lease: Option<Lease>) -> Result<Result<Lease, SkipReason>, EngineError> {
        if let Some(lease) = lease {
            return Ok(self
                .locks
                .refresh(&lease, self.lock_ttl)
                .await?
                .ok_or(SkipReason::LeaseLost));
        }
        if self.locks.is_locked(&self.action, self.lock_ttl).await? {
            return Ok(Err(SkipReason::Locked));
        }
        if self.store.is_empty(&self.action).await? {
            return Ok(Err(SkipReason::Empty));
        }
        Ok(self
            .locks
            .try_acquire(&self.action, self.lock_ttl)
            .await?
            .ok_or(SkipReason::Locked))
    }

    async fn drain(
        &self,
        lease: &Lease,
        stats: &mut CycleStats,
    ) -> Result<CycleOutcome, EngineError> {
        let mut tracker = BudgetTracker::start(&self.budget, self.probe.as_ref());
        loop {
            let Some(mut batch) = self.store.peek_front(&self.action).await? else {
                return self.complete(lease).await;
            };
            if !self.owns(lease).await? {
                return Ok(lost_mid_cycle());
            }

            let mut items = std::mem::take(&mut batch.items).into_iter();
            let mut remaining = Vec::new();
            let mut stop = None;
            for raw in items.by_ref() {
                if let Some(retry) = self.process_item(raw, stats).await {
                    remaining.push(retry);
                }
                // A cancellation or a reclaim hands the queue to someone else; our copy is stale.
                if !self.owns(lease).await? {
                    return Ok(lost_mid_cycle());
                }
                tracker.record_item();
                if let Some(reason) = tracker.exceeded() {
                    stop = Some(reason);
                    break;
                }
            }
            let kept_retries = !remaining.is_empty();
            remaining.extend(items);
            batch.items = remaining;

            if batch.is_empty() {
                self.store.delete_batch(&self.action, &batch.token).await?;
            } else {
                match self.store.update_batch(&self.action, &batch).await {
                    Ok(()) => {}
                    Err(QueueStoreError::BatchNotFound(token)) => {
                        info!(%token, "Batch removed during cycle, dropping its remainder");
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if stop.is_some() || kept_retries {
                let Some(lease) = self.locks.refresh(lease, self.lock_ttl).await? else {
                    warn!("Lease lost before hand-off");
                    return Ok(CycleOutcome::Skipped(SkipReason::LeaseLost));
                };
                debug!(reason = ?stop, "Budget reached or retries pending, continuing later");
                return Ok(CycleOutcome::Continue { lease, reason: stop });
            }
        }
    }

    /// True while the stored lock still carries this lease's token and is live.
    async fn owns(&self, lease: &Lease) -> Result<bool, EngineError> {
        let stored = self.locks.current(&self.action).await?;
        Ok(stored.is_some_and(|s| s.token == lease.token && !s.is_expired(self.lock_ttl)))
    }

    /// Handle one raw item. Returns the value to keep in place when the task asks for a retry.
    async fn process_item(&self, raw: Value, stats: &mut CycleStats) -> Option<Value> {
        let item: T::Item = match serde_json::from_value(raw.clone()) {
            Ok(item) => item,
            Err(e) => {
                warn!(item = %raw, error = %e, "Undecodable item, dropping it");
                stats.failed += 1;
                return None;
            }
        };

        match AssertUnwindSafe(self.task.handle(item)).catch_unwind().await {
            Ok(Ok(Outcome::Done)) => {
                stats.processed += 1;
                None
            }
            Ok(Ok(Outcome::Retry(next))) => match serde_json::to_value(&next) {
                Ok(value) => {
                    stats.retried += 1;
                    Some(value)
                }
                Err(e) => {
                    warn!(item = %raw, error = %e, "Retry item could not be encoded, dropping it");
                    stats.failed += 1;
                    None
                }
            },
            Ok(Err(e)) => {
                warn!(item = %raw, error = %e, "Item failed, dropping it");
                stats.failed += 1;
                None
            }
            Err(panic) => {
                let panic = panic_message(panic.as_ref());
                error!(item = %raw, panic, "Task panicked, dropping item");
                stats.failed += 1;
                None
            }
        }
    }

    async fn complete(&self, lease: &Lease) -> Result<CycleOutcome, EngineError> {
        if !self.locks.release_owned(lease).await? {
            warn!("Lease lost before completion, leaving the lock alone");
            return Ok(CycleOutcome::Skipped(SkipReason::LeaseLost));
        }
        self.task.on_complete(&self.action).await;
        info!(action = %self.action, "Queue drained");
        Ok(CycleOutcome::Completed)
    }

    fn report(&self, outcome: CycleOutcome, stats: CycleStats) -> CycleReport {
        CycleReport {
            action: self.action.clone(),
            outcome,
            stats,
        }
    }
}

fn lost_mid_cycle() -> CycleOutcome {
    warn!("Lease lost mid-cycle, stopping");
    CycleOutcome::Skipped(SkipReason::LeaseLost)
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::budget::MemoryUsage;
    use crate::error::TaskError;
    use crate::lock::InMemoryLockManager;
    use crate::queue::{InMemoryQueueStore, Queue};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) struct NoMemoryPressure;

    impl MemoryProbe for NoMemoryPressure {
        fn usage(&self) -> Option<MemoryUsage> {
            None
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct TestItem {
        pub url: String,
        #[serde(default)]
        pub retries: u32,
        #[serde(default)]
        pub fail: bool,
        #[serde(default)]
        pub panic: bool,
    }

    impl TestItem {
        pub(crate) fn url(url: &str) -> Self {
            Self {
                url: url.to_string(),
                retries: 0,
                fail: false,
                panic: false,
            }
        }
    }

    /// Records every item it sees and counts completions.
    #[derive(Default)]
    pub(crate) struct RecordingTask {
        pub seen: Mutex<Vec<String>>,
        pub completions: AtomicUsize,
    }

    impl RecordingTask {
        pub(crate) fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Task for RecordingTask {
        type Item = TestItem;

        async fn handle(&self, item: TestItem) -> Result<Outcome<TestItem>, TaskError> {
            self.seen.lock().unwrap().push(item.url.clone());
            if item.panic {
                panic!("boom on {}", item.url);
            }
            if item.fail {
                return Err(TaskError::Generic(format!("cannot handle {}", item.url)));
            }
            if item.retries > 0 {
                return Ok(Outcome::Retry(TestItem {
                    retries: item.retries - 1,
                    ..item
                }));
            }
            Ok(Outcome::Done)
        }

        async fn on_complete(&self, _action: &str) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn processor(
        task: Arc<RecordingTask>,
        store: InMemoryQueueStore,
        locks: InMemoryLockManager,
        per_cycle: usize,
    ) -> BatchProcessor<RecordingTask, InMemoryQueueStore, InMemoryLockManager> {
        BatchProcessor::new("cache_preloader", task, store, locks)
            .with_budget(Budget::default().with_item_limit(per_cycle))
            .with_memory_probe(Arc::new(NoMemoryPressure))
    }

    async fn enqueue(store: &InMemoryQueueStore, items: Vec<TestItem>) {
        let mut queue = Queue::new("cache_preloader", store.clone());
        for item in items {
            queue.push(item);
        }
        queue.save().await.unwrap();
    }

    async fn run_to_completion(
        processor: &BatchProcessor<RecordingTask, InMemoryQueueStore, InMemoryLockManager>,
    ) -> usize {
        let mut cycles = 1;
        let mut report = processor.run_cycle(None).await.unwrap();
        while let Some(lease) = report.continuation().cloned() {
            cycles += 1;
            assert!(cycles < 1000, "job never finished");
            report = processor.run_cycle(Some(lease)).await.unwrap();
        }
        assert_eq!(report.outcome, CycleOutcome::Completed);
        cycles
    }

    #[tokio::test]
    async fn three_urls_two_per_cycle() {
        let task = Arc::new(RecordingTask::default());
        let store = InMemoryQueueStore::new();
        let locks = InMemoryLockManager::new();
        let processor = processor(task.clone(), store.clone(), locks.clone(), 2);
        enqueue(
            &store,
            vec![TestItem::url("/a"), TestItem::url("/b"), TestItem::url("/c")],
        )
        .await;

        let first = processor.run_cycle(None).await.unwrap();
        let lease = first.continuation().cloned().expect("job should continue");
        let front = store.peek_front("cache_preloader").await.unwrap().unwrap();
        let remaining: Vec<TestItem> = front
            .items
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect();
        assert_eq!(remaining, vec![TestItem::url("/c")]);
        assert!(locks.is_locked("cache_preloader", processor.lock_ttl()).await.unwrap());
        assert_eq!(task.completions.load(Ordering::SeqCst), 0);

        let second = processor.run_cycle(Some(lease)).await.unwrap();
        assert_eq!(second.outcome, CycleOutcome::Completed);
        assert!(store.is_empty("cache_preloader").await.unwrap());
        assert!(!locks.is_locked("cache_preloader", processor.lock_ttl()).await.unwrap());
        assert_eq!(task.completions.load(Ordering::SeqCst), 1);
        assert_eq!(task.seen(), vec!["/a", "/b", "/c"]);
    }

    #[tokio::test]
    async fn every_item_seen_exactly_once_across_many_cycles() {
        let task = Arc::new(RecordingTask::default());
        let store = InMemoryQueueStore::new();
        let processor = processor(task.clone(), store.clone(), InMemoryLockManager::new(), 3);
        let mut expected = Vec::new();
        for batch in 0..4 {
            let items: Vec<_> = (0..5)
                .map(|i| TestItem::url(&format!("/{batch}/{i}")))
                .collect();
            expected.extend(items.iter().map(|i| i.url.clone()));
            enqueue(&store, items).await;
        }

        let cycles = run_to_completion(&processor).await;
        assert_eq!(cycles, 7);
        assert_eq!(task.seen(), expected);
        assert_eq!(task.completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retried_items_come_back_in_place() {
        let task = Arc::new(RecordingTask::default());
        let store = InMemoryQueueStore::new();
        let processor = processor(task.clone(), store.clone(), InMemoryLockManager::new(), 100);
        let mut mobile = TestItem::url("/m");
        mobile.retries = 1;
        enqueue(&store, vec![TestItem::url("/a"), mobile, TestItem::url("/z")]).await;

        let first = processor.run_cycle(None).await.unwrap();
        assert_eq!(first.stats.retried, 1);
        let lease = first.continuation().cloned().unwrap();
        let front = store.peek_front("cache_preloader").await.unwrap().unwrap();
        assert_eq!(front.items.len(), 1);

        let second = processor.run_cycle(Some(lease)).await.unwrap();
        assert_eq!(second.outcome, CycleOutcome::Completed);
        assert_eq!(task.seen(), vec!["/a", "/m", "/z", "/m"]);
    }

    #[tokio::test]
    async fn failing_and_panicking_items_are_dropped() {
        let task = Arc::new(RecordingTask::default());
        let store = InMemoryQueueStore::new();
        let processor = processor(task.clone(), store.clone(), InMemoryLockManager::new(), 100);
        let mut bad = TestItem::url("/bad");
        bad.fail = true;
        let mut boom = TestItem::url("/boom");
        boom.panic = true;
        enqueue(&store, vec![bad, boom, TestItem::url("/ok")]).await;
        store
            .insert_batch("cache_preloader", crate::queue::Batch::new(vec![Value::from(7)]))
            .await
            .unwrap();

        let report = processor.run_cycle(None).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!(report.stats.failed, 3);
        assert_eq!(report.stats.processed, 1);
        assert_eq!(task.seen(), vec!["/bad", "/boom", "/ok"]);
    }

    #[tokio::test]
    async fn fresh_start_is_a_noop_while_locked_or_empty() {
        let task = Arc::new(RecordingTask::default());
        let store = InMemoryQueueStore::new();
        let locks = InMemoryLockManager::new();
        let processor = processor(task.clone(), store.clone(), locks.clone(), 100);

        let empty = processor.run_cycle(None).await.unwrap();
        assert_eq!(empty.outcome, CycleOutcome::Skipped(SkipReason::Empty));

        enqueue(&store, vec![TestItem::url("/a")]).await;
        locks
            .try_acquire("cache_preloader", processor.lock_ttl())
            .await
            .unwrap()
            .unwrap();
        let locked = processor.run_cycle(None).await.unwrap();
        assert_eq!(locked.outcome, CycleOutcome::Skipped(SkipReason::Locked));
        assert!(task.seen().is_empty());
        assert_eq!(task.completions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn continuation_with_a_stale_lease_is_rejected() {
        let task = Arc::new(RecordingTask::default());
        let store = InMemoryQueueStore::new();
        let locks = InMemoryLockManager::new();
        let processor = processor(task.clone(), store.clone(), locks.clone(), 1);
        enqueue(&store, vec![TestItem::url("/a"), TestItem::url("/b")]).await;

        let first = processor.run_cycle(None).await.unwrap();
        let lease = first.continuation().cloned().unwrap();
        locks.release("cache_preloader").await.unwrap();

        let second = processor.run_cycle(Some(lease)).await.unwrap();
        assert_eq!(second.outcome, CycleOutcome::Skipped(SkipReason::LeaseLost));
        assert_eq!(task.seen(), vec!["/a"]);
    }

    #[tokio::test]
    async fn abandoned_lock_is_recovered_by_a_fresh_cycle() {
        let task = Arc::new(RecordingTask::default());
        let store = InMemoryQueueStore::new();
        let locks = InMemoryLockManager::new();
        let processor = processor(task.clone(), store.clone(), locks.clone(), 100);
        enqueue(&store, vec![TestItem::url("/a")]).await;
        let mut crashed = Lease::new("cache_preloader");
        crashed.acquired_at = chrono::Utc::now() - chrono::Duration::minutes(30);
        locks.insert_lease(crashed).await;

        let report = processor.run_cycle(None).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!(task.seen(), vec!["/a"]);
    }

    /// Cancels its own job while handling `/a`, the way `Job::cancel` does. With `take_over`
    /// a second worker then queues `/new` and takes the lock.
    struct CancelledMidCycle {
        store: InMemoryQueueStore,
        locks: InMemoryLockManager,
        take_over: bool,
        rival: Mutex<Option<Lease>>,
        inner: RecordingTask,
    }

    impl CancelledMidCycle {
        fn new(store: &InMemoryQueueStore, locks: &InMemoryLockManager, take_over: bool) -> Self {
            Self {
                store: store.clone(),
                locks: locks.clone(),
                take_over,
                rival: Mutex::new(None),
                inner: RecordingTask::default(),
            }
        }
    }

    #[async_trait]
    impl Task for CancelledMidCycle {
        type Item = TestItem;

        async fn handle(&self, item: TestItem) -> Result<Outcome<TestItem>, TaskError> {
            let cancel = item.url == "/a";
            let outcome = self.inner.handle(item).await;
            if cancel {
                self.store.clear("cache_preloader").await.unwrap();
                self.locks.release("cache_preloader").await.unwrap();
                if self.take_over {
                    enqueue(&self.store, vec![TestItem::url("/new")]).await;
                    let ttl = Duration::from_secs(600);
                    let lease = self.locks.try_acquire("cache_preloader", ttl).await.unwrap();
                    *self.rival.lock().unwrap() = lease;
                }
            }
            outcome
        }

        async fn on_complete(&self, action: &str) {
            self.inner.on_complete(action).await;
        }
    }

    #[tokio::test]
    async fn cancellation_stops_the_cycle_after_the_current_item() {
        let store = InMemoryQueueStore::new();
        let locks = InMemoryLockManager::new();
        let task = Arc::new(CancelledMidCycle::new(&store, &locks, true));
        let processor =
            BatchProcessor::new("cache_preloader", task.clone(), store.clone(), locks.clone())
                .with_memory_probe(Arc::new(NoMemoryPressure));
        enqueue(
            &store,
            vec![TestItem::url("/a"), TestItem::url("/b"), TestItem::url("/c")],
        )
        .await;

        let report = processor.run_cycle(None).await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Skipped(SkipReason::LeaseLost));
        assert_eq!(task.inner.seen(), vec!["/a"]);
        assert_eq!(task.inner.completions.load(Ordering::SeqCst), 0);
        // the second worker keeps its lock and its batch
        let rival = task.rival.lock().unwrap().clone().expect("second worker took the lock");
        assert_eq!(locks.current("cache_preloader").await.unwrap(), Some(rival));
        let front = store.peek_front("cache_preloader").await.unwrap().unwrap();
        assert_eq!(front.items, vec![serde_json::to_value(TestItem::url("/new")).unwrap()]);
        assert_eq!(store.batch_count("cache_preloader").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_cycle_does_not_fire_completion() {
        let store = InMemoryQueueStore::new();
        let locks = InMemoryLockManager::new();
        let task = Arc::new(CancelledMidCycle::new(&store, &locks, false));
        let processor =
            BatchProcessor::new("cache_preloader", task.clone(), store.clone(), locks.clone())
                .with_memory_probe(Arc::new(NoMemoryPressure));
        enqueue(&store, vec![TestItem::url("/a"), TestItem::url("/b")]).await;
        enqueue(&store, vec![TestItem::url("/c")]).await;

        let report = processor.run_cycle(None).await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Skipped(SkipReason::LeaseLost));
        assert_eq!(task.inner.seen(), vec!["/a"]);
        assert_eq!(task.inner.completions.load(Ordering::SeqCst), 0);
        assert!(store.is_empty("cache_preloader").await.unwrap());
        assert!(locks.current("cache_preloader").await.unwrap().is_none());
    }
}
