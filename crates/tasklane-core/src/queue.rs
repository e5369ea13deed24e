//! Persisted batch queues.
//!
//! This module defines the QueueStore trait for persisting batches of work items per action,
//! an in-memory implementation for testing and local development, and the [`Queue`] producer
//! handle that buffers items before saving them as one batch.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::error::QueueStoreError;

/// Opaque identifier of a persisted batch.
///
/// Built from the creation time in microseconds followed by a random suffix so that
/// concurrent producers never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchToken(String);

impl BatchToken {
    /// A new token, ordered by creation time.
    pub fn generate() -> Self {
        let micros = Utc::now().timestamp_micros().max(0) as u64;
        Self(format!("batch_{:016x}{:08x}", micros, rand::random::<u32>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for BatchToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for BatchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A persisted chunk of an action's pending items, in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Unique, time-ordered identifier.
    pub token: BatchToken,
    /// Items still to process, in order.
    pub items: Vec<Value>,
}

impl Batch {
    /// A batch with a freshly generated token.
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            token: BatchToken::generate(),
            items,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Trait for the shared persistence of per-action batch queues.
///
/// Batches of one action are kept in FIFO order. Every worker reads and writes through
/// the store; nothing about the queue is cached between cycles.
#[async_trait]
pub trait QueueStore: Clone + Send + Sync + 'static {
    /// Durably append a batch to the back of the action's queue.
    async fn insert_batch(&self, action: &str, batch: Batch) -> Result<(), QueueStoreError>;

    /// Return the oldest batch of the action, if any.
    async fn peek_front(&self, action: &str) -> Result<Option<Batch>, QueueStoreError>;

    /// Overwrite the items of an existing batch, keeping its queue position.
    async fn update_batch(&self, action: &str, batch: &Batch) -> Result<(), QueueStoreError>;

    /// Remove a batch. Removing a batch that no longer exists is not an error.
    async fn delete_batch(&self, action: &str, token: &BatchToken) -> Result<(), QueueStoreError>;

    /// Returns true when the action has no batches left.
    async fn is_empty(&self, action: &str) -> Result<bool, QueueStoreError>;

    /// Number of batches queued for the action.
    async fn batch_count(&self, action: &str) -> Result<usize, QueueStoreError>;

    /// Number of items across all batches of the action.
    async fn pending_items(&self, action: &str) -> Result<usize, QueueStoreError>;

    /// Atomically remove every batch of the action.
    async fn clear(&self, action: &str) -> Result<(), QueueStoreError>;

    /// Actions that currently have at least one batch.
    async fn actions(&self) -> Result<Vec<String>, QueueStoreError>;
}

/// In-memory implementation of QueueStore for testing and local development.
#[derive(Clone, Default)]
pub struct InMemoryQueueStore(Arc<Mutex<HashMap<String, VecDeque<Batch>>>>);

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn insert_batch(&self, action: &str, batch: Batch) -> Result<(), QueueStoreError> {
        let mut map = self.0.lock().await;
        map.entry(action.to_string()).or_default().push_back(batch);
        Ok(())
    }

    async fn peek_front(&self, action: &str) -> Result<Option<Batch>, QueueStoreError> {
        let map = self.0.lock().await;
        Ok(map.get(action).and_then(|q| q.front().cloned()))
    }

    async fn update_batch(&self, action: &str, batch: &Batch) -> Result<(), QueueStoreError> {
        let mut map = self.0.lock().await;
        let slot = map
            .get_mut(action)
            .and_then(|q| q.iter_mut().find(|b| b.token == batch.token))
            .ok_or_else(|| QueueStoreError::BatchNotFound(batch.token.to_string()))?;
        slot.items = batch.items.clone();
        Ok(())
    }

    async fn delete_batch(&self, action: &str, token: &BatchToken) -> Result<(), QueueStoreError> {
        let mut map = self.0.lock().await;
        if let Some(q) = map.get_mut(action) {
            q.retain(|b| &b.token != token);
            if q.is_empty() {
                map.remove(action);
            }
        }
        Ok(())
    }

    async fn is_empty(&self, action: &str) -> Result<bool, QueueStoreError> {
        let map = self.0.lock().await;
        Ok(map.get(action).map_or(true, |q| q.is_empty()))
    }

    async fn batch_count(&self, action: &str) -> Result<usize, QueueStoreError> {
        let map = self.0.lock().await;
        Ok(map.get(action).map_or(0, |q| q.len()))
    }

    async fn pending_items(&self, action: &str) -> Result<usize, QueueStoreError> {
        let map = self.0.lock().await;
        Ok(map
            .get(action)
            .map_or(0, |q| q.iter().map(|b| b.items.len()).sum()))
    }

    async fn clear(&self, action: &str) -> Result<(), QueueStoreError> {
        let mut map = self.0.lock().await;
        map.remove(action);
        Ok(())
    }

    async fn actions(&self) -> Result<Vec<String>, QueueStoreError> {
        let map = self.0.lock().await;
        Ok(map
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(action, _)| action.clone())
            .collect())
    }
}

/// Producer handle for one action.
///
/// Items pushed here stay in a private buffer until [`Queue::save`] persists them as a
/// single new batch. A failed save keeps the buffer so nothing is lost before it is durable.
pub struct Queue<I, Q> {
    action: String,
    store: Q,
    buffer: Vec<I>,
}

impl<I, Q> Queue<I, Q>
where
    I: Serialize + Send,
    Q: QueueStore,
{
    /// An empty producer buffer for `action`.
    pub fn new(action: impl Into<String>, store: Q) -> Self {
        Self {
            action: action.into(),
            store,
            buffer: Vec::new(),
        }
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    /// Append an item to the pending buffer. Not durable until [`Queue::save`].
    pub fn push(&mut self, item: I) -> &mut Self {
        self.buffer.push(item);
        self
    }

    /// Items buffered but not yet saved.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Persist the buffer as one batch and clear it.
    ///
    /// Returns `Ok(None)` when there was nothing to save.
    #[instrument(
        skip(self),
        fields(action = %self.action, buffered = self.buffer.len()),
        level = "debug"
    )]
    pub async fn save(&mut self) -> Result<Option<BatchToken>, QueueStoreError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let items = self
            .buffer
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| QueueStoreError::Serialization(e.to_string()))?;
        let batch = Batch::new(items);
        let token = batch.token.clone();
        self.store.insert_batch(&self.action, batch).await?;
        self.buffer.clear();
        debug!(%token, "Saved batch");
        Ok(Some(token))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Store that refuses writes until told otherwise.
    #[derive(Clone, Default)]
    pub(crate) struct FlakyStore {
        pub inner: InMemoryQueueStore,
        pub failing: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl QueueStore for FlakyStore {
        async fn insert_batch(&self, action: &str, batch: Batch) -> Result<(), QueueStoreError> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(QueueStoreError::Io("write refused".into()));
            }
            self.inner.insert_batch(action, batch).await
        }
        async fn peek_front(&self, action: &str) -> Result<Option<Batch>, QueueStoreError> {
            self.inner.peek_front(action).await
        }
        async fn update_batch(&self, action: &str, batch: &Batch) -> Result<(), QueueStoreError> {
            self.inner.update_batch(action, batch).await
        }
        async fn delete_batch(
            &self,
            action: &str,
            token: &BatchToken,
        ) -> Result<(), QueueStoreError> {
            self.inner.delete_batch(action, token).await
        }
        async fn is_empty(&self, action: &str) -> Result<bool, QueueStoreError> {
            self.inner.is_empty(action).await
        }
        async fn batch_count(&self, action: &str) -> Result<usize, QueueStoreError> {
            self.inner.batch_count(action).await
        }
        async fn pending_items(&self, action: &str) -> Result<usize, QueueStoreError> {
            self.inner.pending_items(action).await
        }
        async fn clear(&self, action: &str) -> Result<(), QueueStoreError> {
            self.inner.clear(action).await
        }
        async fn actions(&self) -> Result<Vec<String>, QueueStoreError> {
            self.inner.actions().await
        }
    }

    #[tokio::test]
    async fn batches_are_fifo_per_action() {
        let store = InMemoryQueueStore::new();
        let mut queue = Queue::new("purge", store.clone());
        queue.push("first");
        let first = queue.save().await.unwrap().unwrap();
        queue.push("second").push("third");
        queue.save().await.unwrap();

        let front = store.peek_front("purge").await.unwrap().unwrap();
        assert_eq!(front.token, first);
        assert_eq!(front.items, vec![Value::from("first")]);
        assert_eq!(store.batch_count("purge").await.unwrap(), 2);
        assert_eq!(store.pending_items("purge").await.unwrap(), 3);
        assert!(store.is_empty("preload").await.unwrap());
    }

    #[tokio::test]
    async fn saving_an_empty_buffer_creates_nothing() {
        let store = InMemoryQueueStore::new();
        let mut queue: Queue<String, _> = Queue::new("purge", store.clone());
        assert!(queue.save().await.unwrap().is_none());
        assert!(store.is_empty("purge").await.unwrap());
    }

    #[tokio::test]
    async fn failed_save_keeps_the_buffer() {
        let store = FlakyStore::default();
        store.failing.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut queue = Queue::new("preload", store.clone());
        queue.push("/a").push("/b");

        assert!(queue.save().await.is_err());
        assert_eq!(queue.buffered(), 2);

        store.failing.store(false, std::sync::atomic::Ordering::SeqCst);
        assert!(queue.save().await.unwrap().is_some());
        assert_eq!(queue.buffered(), 0);
        assert_eq!(store.pending_items("preload").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let store = InMemoryQueueStore::new();
        let a = Batch::new(vec![Value::from(1)]);
        let b = Batch::new(vec![Value::from(2)]);
        store.insert_batch("db", a.clone()).await.unwrap();
        store.insert_batch("db", b.clone()).await.unwrap();

        store.delete_batch("db", &a.token).await.unwrap();
        assert_eq!(store.peek_front("db").await.unwrap().unwrap().token, b.token);
        // deleting twice is a no-op
        store.delete_batch("db", &a.token).await.unwrap();

        store.clear("db").await.unwrap();
        assert!(store.is_empty("db").await.unwrap());
        assert!(store.actions().await.unwrap().is_empty());
    }
}
