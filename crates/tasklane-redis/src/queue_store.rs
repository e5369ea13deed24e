//! Redis implementation of the QueueStore trait.
//!
//! Each action owns a list of batch tokens (queue order) and a hash from token to the
//! JSON-encoded items. Multi-key changes run as Lua scripts or MULTI pipelines so the two
//! never disagree.

use crate::client::RedisClient;
use async_trait::async_trait;
use redis::{AsyncCommands, Script};
use serde_json::Value;
use tasklane_core::{Batch, BatchToken, QueueStore, QueueStoreError};
use tracing::{error, instrument, trace};

const PEEK_FRONT: &str = r#"
local token = redis.call('LINDEX', KEYS[1], 0)
if not token then return nil end
local items = redis.call('HGET', KEYS[2], token)
if not items then return nil end
return {token, items}
"#;

const UPDATE_BATCH: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then return 0 end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return 1
"#;

const DELETE_BATCH: &str = r#"
redis.call('LREM', KEYS[1], 0, ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
if redis.call('LLEN', KEYS[1]) == 0 then
  redis.call('SREM', KEYS[3], ARGV[2])
end
return 1
"#;

fn io_error(op: &str, e: redis::RedisError) -> QueueStoreError {
    error!("Redis error while {}: {}", op, e);
    QueueStoreError::Io(e.to_string())
}

fn decode_items(raw: &str) -> Result<Vec<Value>, QueueStoreError> {
    serde_json::from_str(raw).map_err(|e| QueueStoreError::Serialization(e.to_string()))
}

/// Redis implementation of the QueueStore trait.
#[derive(Clone)]
pub struct RedisQueueStore {
    client: RedisClient,
}

impl RedisQueueStore {
    /// Create a new Redis queue store with the given client.
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }

    fn queue_key(&self, action: &str) -> String {
        self.client.prefixed_key(&format!("queue:{}", action))
    }

    fn batches_key(&self, action: &str) -> String {
        self.client.prefixed_key(&format!("batches:{}", action))
    }

    /// Set of actions with at least one batch.
    fn actions_key(&self) -> String {
        self.client.prefixed_key("actions")
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    #[instrument(
        skip(self, batch),
        fields(token = %batch.token, items = batch.items.len()),
        level = "trace"
    )]
    async fn insert_batch(&self, action: &str, batch: Batch) -> Result<(), QueueStoreError> {
        let serialized = serde_json::to_string(&batch.items)
            .map_err(|e| QueueStoreError::Serialization(e.to_string()))?;
        let mut conn = self.client.conn.clone();
        let _result: () = redis::pipe()
            .atomic()
            .hset(self.batches_key(action), batch.token.as_str(), serialized)
            .rpush(self.queue_key(action), batch.token.as_str())
            .sadd(self.actions_key(), action)
            .query_async(&mut conn)
            .await
            .map_err(|e| io_error("inserting batch", e))?;
        trace!(action, token = %batch.token, "Inserted batch");
        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    async fn peek_front(&self, action: &str) -> Result<Option<Batch>, QueueStoreError> {
        let mut conn = self.client.conn.clone();
        let front: Option<(String, String)> = Script::new(PEEK_FRONT)
            .key(self.queue_key(action))
            .key(self.batches_key(action))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| io_error("peeking queue", e))?;
        match front {
            Some((token, raw)) => Ok(Some(Batch {
                token: BatchToken::from(token),
                items: decode_items(&raw)?,
            })),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, batch), fields(token = %batch.token), level = "trace")]
    async fn update_batch(&self, action: &str, batch: &Batch) -> Result<(), QueueStoreError> {
        let serialized = serde_json::to_string(&batch.items)
            .map_err(|e| QueueStoreError::Serialization(e.to_string()))?;
        let mut conn = self.client.conn.clone();
        let updated: i64 = Script::new(UPDATE_BATCH)
            .key(self.batches_key(action))
            .arg(batch.token.as_str())
            .arg(serialized)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| io_error("updating batch", e))?;
        if updated == 0 {
            return Err(QueueStoreError::BatchNotFound(batch.token.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    async fn delete_batch(&self, action: &str, token: &BatchToken) -> Result<(), QueueStoreError> {
        let mut conn = self.client.conn.clone();
        let _deleted: i64 = Script::new(DELETE_BATCH)
            .key(self.queue_key(action))
            .key(self.batches_key(action))
            .key(self.actions_key())
            .arg(token.as_str())
            .arg(action)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| io_error("deleting batch", e))?;
        Ok(())
    }

    async fn is_empty(&self, action: &str) -> Result<bool, QueueStoreError> {
        Ok(self.batch_count(action).await? == 0)
    }

    async fn batch_count(&self, action: &str) -> Result<usize, QueueStoreError> {
        let mut conn = self.client.conn.clone();
        conn.llen(self.queue_key(action))
            .await
            .map_err(|e| io_error("counting batches", e))
    }

    async fn pending_items(&self, action: &str) -> Result<usize, QueueStoreError> {
        let mut conn = self.client.conn.clone();
        let batches: Vec<String> = conn
            .hvals(self.batches_key(action))
            .await
            .map_err(|e| io_error("counting items", e))?;
        let mut total = 0;
        for raw in &batches {
            total += decode_items(raw)?.len();
        }
        Ok(total)
    }

    #[instrument(skip(self), level = "trace")]
    async fn clear(&self, action: &str) -> Result<(), QueueStoreError> {
        let mut conn = self.client.conn.clone();
        let _result: () = redis::pipe()
            .atomic()
            .del(self.queue_key(action))
            .del(self.batches_key(action))
            .srem(self.actions_key(), action)
            .query_async(&mut conn)
            .await
            .map_err(|e| io_error("clearing queue", e))?;
        trace!(action, "Cleared queue");
        Ok(())
    }

    async fn actions(&self) -> Result<Vec<String>, QueueStoreError> {
        let mut conn = self.client.conn.clone();
        let mut actions: Vec<String> = conn
            .smembers(self.actions_key())
            .await
            .map_err(|e| io_error("listing actions", e))?;
        actions.sort();
        Ok(actions)
    }
}
