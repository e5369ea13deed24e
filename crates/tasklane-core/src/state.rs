//! Runtime state shared between cycles.
//!
//! Task adapters keep their progress here (crawl offsets, restart times, cached counts) so it
//! survives across the short-lived invocations that make up one job.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::StateStoreError;

/// Trait for a shared key/value store of runtime state.
#[async_trait]
pub trait StateStore: Clone + Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Value>, StateStoreError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), StateStoreError>;
    async fn delete(&self, key: &str) -> Result<(), StateStoreError>;
}

/// Load and decode a typed value.
pub async fn load<S, T>(store: &S, key: &str) -> Result<Option<T>, StateStoreError>
where
    S: StateStore,
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StateStoreError::Serialization(e.to_string())),
        None => Ok(None),
    }
}

/// Encode and store a typed value.
pub async fn save<S, T>(store: &S, key: &str, value: &T) -> Result<(), StateStoreError>
where
    S: StateStore,
    T: Serialize + Sync + ?Sized,
{
    let value =
        serde_json::to_value(value).map_err(|e| StateStoreError::Serialization(e.to_string()))?;
    store.set(key, value).await
}

/// In-memory implementation of StateStore for testing and local development.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    inner: Arc<Mutex<HashMap<String, Value>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StateStoreError> {
        let map = self.inner.lock().await;
        Ok(map.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StateStoreError> {
        let mut map = self.inner.lock().await;
        map.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StateStoreError> {
        let mut map = self.inner.lock().await;
        map.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn typed_roundtrip() {
        let store = InMemoryStateStore::new();
        save(&store, "preload.offset", &42_usize).await.unwrap();
        let offset: Option<usize> = load(&store, "preload.offset").await.unwrap();
        assert_eq!(offset, Some(42));

        store.delete("preload.offset").await.unwrap();
        let offset: Option<usize> = load(&store, "preload.offset").await.unwrap();
        assert_eq!(offset, None);
    }

    #[tokio::test]
    async fn wrong_type_is_a_serialization_error() {
        let store = InMemoryStateStore::new();
        store.set("k", Value::from("not a number")).await.unwrap();
        let err = load::<_, u64>(&store, "k").await.unwrap_err();
        assert!(matches!(err, StateStoreError::Serialization(_)));
    }
}
