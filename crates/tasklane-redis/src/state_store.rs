//! Redis implementation of the StateStore trait.

use crate::client::RedisClient;
use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::Value;
use tasklane_core::{StateStore, StateStoreError};
use tracing::error;

fn io_error(op: &str, e: redis::RedisError) -> StateStoreError {
    error!("Redis error while {}: {}", op, e);
    StateStoreError::Io(e.to_string())
}

/// Redis implementation of the StateStore trait. Values are stored as JSON strings.
#[derive(Clone)]
pub struct RedisStateStore {
    client: RedisClient,
}

impl RedisStateStore {
    /// Create a new Redis state store with the given client.
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }

    fn state_key(&self, key: &str) -> String {
        self.client.prefixed_key(&format!("state:{}", key))
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StateStoreError> {
        let mut conn = self.client.conn.clone();
        let raw: Option<String> = conn
            .get(self.state_key(key))
            .await
            .map_err(|e| io_error("reading state", e))?;
        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|e| StateStoreError::Serialization(e.to_string()))
        })
        .transpose()
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StateStoreError> {
        let serialized = serde_json::to_string(&value)
            .map_err(|e| StateStoreError::Serialization(e.to_string()))?;
        let mut conn = self.client.conn.clone();
        let _result: () = conn
            .set(self.state_key(key), serialized)
            .await
            .map_err(|e| io_error("writing state", e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StateStoreError> {
        let mut conn = self.client.conn.clone();
        let _removed: i64 = conn
            .del(self.state_key(key))
            .await
            .map_err(|e| io_error("deleting state", e))?;
        Ok(())
    }
}
