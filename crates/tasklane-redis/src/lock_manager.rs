//! Redis implementation of the LockManager trait.
//!
//! The lease is stored as JSON under one key per action with a matching PX expiry, so an
//! abandoned lock also disappears on the Redis side.

use crate::client::RedisClient;
use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tasklane_core::{Lease, LockError, LockManager};
use tracing::{debug, error, instrument, warn};

/// Replace the lease only if the stored token still matches.
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then return 0 end
if cjson.decode(current)['token'] ~= ARGV[1] then return 0 end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return 1
"#;

/// Delete the lease only if the stored token still matches.
const COMPARE_AND_DELETE: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then return 0 end
if cjson.decode(current)['token'] ~= ARGV[1] then return 0 end
redis.call('DEL', KEYS[1])
return 1
"#;

fn io_error(op: &str, e: redis::RedisError) -> LockError {
    error!("Redis error while {}: {}", op, e);
    LockError::Io(e.to_string())
}

fn encode(lease: &Lease) -> Result<String, LockError> {
    serde_json::to_string(lease)
        .map_err(|e| LockError::Other(format!("Serialization error: {}", e)))
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Redis implementation of the LockManager trait.
#[derive(Clone)]
pub struct RedisLockManager {
    client: RedisClient,
}

impl RedisLockManager {
    /// Create a new Redis lock manager with the given client.
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }

    fn lock_key(&self, action: &str) -> String {
        self.client.prefixed_key(&format!("lock:{}", action))
    }

    async fn compare_and_set(
        &self,
        expected_token: &str,
        lease: &Lease,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.client.conn.clone();
        let swapped: i64 = Script::new(COMPARE_AND_SET)
            .key(self.lock_key(&lease.action))
            .arg(expected_token)
            .arg(encode(lease)?)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| io_error("swapping lease", e))?;
        Ok(swapped == 1)
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    #[instrument(skip(self), level = "trace")]
    async fn try_acquire(&self, action: &str, ttl: Duration) -> Result<Option<Lease>, LockError> {
        let lease = Lease::new(action);
        let mut conn = self.client.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(action))
            .arg(encode(&lease)?)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| io_error("acquiring lock", e))?;
        if set.is_some() {
            return Ok(Some(lease));
        }
        // The key outlives its lease when an earlier owner used a longer TTL.
        match self.current(action).await? {
            Some(existing) if existing.is_expired(ttl) => {
                warn!(action, acquired_at = %existing.acquired_at, "Reclaiming abandoned lock");
                if self.compare_and_set(&existing.token, &lease, ttl).await? {
                    Ok(Some(lease))
                } else {
                    Ok(None)
                }
            }
            _ => {
                debug!(action, "Lock held by another worker");
                Ok(None)
            }
        }
    }

    async fn is_locked(&self, action: &str, ttl: Duration) -> Result<bool, LockError> {
        Ok(self
            .current(action)
            .await?
            .is_some_and(|lease| !lease.is_expired(ttl)))
    }

    async fn current(&self, action: &str) -> Result<Option<Lease>, LockError> {
        let mut conn = self.client.conn.clone();
        let raw: Option<String> = conn
            .get(self.lock_key(action))
            .await
            .map_err(|e| io_error("reading lock", e))?;
        raw.map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|e| LockError::Other(format!("Corrupt lease for {}: {}", action, e)))
        })
        .transpose()
    }

    #[instrument(skip(self, lease), fields(action = %lease.action), level = "trace")]
    async fn refresh(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, LockError> {
        let renewed = Lease {
            acquired_at: Utc::now(),
            ..lease.clone()
        };
        if self.compare_and_set(&lease.token, &renewed, ttl).await? {
            Ok(Some(renewed))
        } else {
            Ok(None)
        }
    }

    async fn release(&self, action: &str) -> Result<(), LockError> {
        let mut conn = self.client.conn.clone();
        let _removed: i64 = conn
            .del(self.lock_key(action))
            .await
            .map_err(|e| io_error("releasing lock", e))?;
        Ok(())
    }

    async fn release_owned(&self, lease: &Lease) -> Result<bool, LockError> {
        let mut conn = self.client.conn.clone();
        let removed: i64 = Script::new(COMPARE_AND_DELETE)
            .key(self.lock_key(&lease.action))
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| io_error("releasing owned lock", e))?;
        Ok(removed == 1)
    }
}
