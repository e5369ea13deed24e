//! Single-flight locking per action.
//!
//! A [`Lease`] is the persisted lock record. At most one live lease exists per action;
//! a lease older than its TTL is considered abandoned and can be reclaimed by any worker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::error::LockError;

/// The lock record for one action.
///
/// The token lets a continuation prove that it still owns the lock it was handed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Action the lease guards.
    pub action: String,
    /// Random owner token.
    pub token: String,
    /// Time of acquisition or last refresh.
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    /// A lease for `action` with a fresh token, acquired now.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            token: uuid::Uuid::new_v4().to_string(),
            acquired_at: Utc::now(),
        }
    }

    /// True when the lease is older than `ttl` at `now`.
    pub fn is_expired_at(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.acquired_at >= ttl,
            // a TTL too large for chrono never expires
            Err(_) => false,
        }
    }

    /// True when the lease is older than `ttl` now.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.is_expired_at(ttl, Utc::now())
    }
}

/// Trait for a shared lock manager.
///
/// Implementations must provide an atomic add-if-absent for `try_acquire`, so two workers
/// that both observe "no lock" cannot both win.
#[async_trait]
pub trait LockManager: Clone + Send + Sync + 'static {
    /// Acquire the action's lock if no live lease exists. Returns `None` on contention.
    async fn try_acquire(&self, action: &str, ttl: Duration) -> Result<Option<Lease>, LockError>;

    /// True when a lease younger than `ttl` exists.
    async fn is_locked(&self, action: &str, ttl: Duration) -> Result<bool, LockError>;

    /// The stored lease, live or not.
    async fn current(&self, action: &str) -> Result<Option<Lease>, LockError>;

    /// Renew a lease held by the caller.
    ///
    /// Returns `None` when the stored token no longer matches, i.e. the lease expired and was
    /// reclaimed, or was released by a cancellation.
    async fn refresh(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, LockError>;

    /// Delete the action's lock unconditionally.
    async fn release(&self, action: &str) -> Result<(), LockError>;

    /// Delete the lock only while it still carries `lease.token`.
    ///
    /// Returns `false` when another lease, or none, is stored; that lock is left untouched.
    async fn release_owned(&self, lease: &Lease) -> Result<bool, LockError>;
}

/// In-memory implementation of LockManager for testing and local development.
#[derive(Clone, Default)]
pub struct InMemoryLockManager {
    inner: Arc<Mutex<HashMap<String, Lease>>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a lease as-is, bypassing contention checks. Useful to simulate a crashed worker.
    pub async fn insert_lease(&self, lease: Lease) {
        let mut map = self.inner.lock().await;
        map.insert(lease.action.clone(), lease);
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    #[instrument(skip(self), level = "trace")]
    async fn try_acquire(&self, action: &str, ttl: Duration) -> Result<Option<Lease>, LockError> {
        let mut map = self.inner.lock().await;
        if let Some(existing) = map.get(action) {
            if !existing.is_expired(ttl) {
                debug!(action, "Lock held by another worker");
                return Ok(None);
            }
            warn!(action, acquired_at = %existing.acquired_at, "Reclaiming abandoned lock");
        }
        let lease = Lease::new(action);
        map.insert(action.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn is_locked(&self, action: &str, ttl: Duration) -> Result<bool, LockError> {
        let map = self.inner.lock().await;
        Ok(map.get(action).is_some_and(|l| !l.is_expired(ttl)))
    }

    async fn current(&self, action: &str) -> Result<Option<Lease>, LockError> {
        let map = self.inner.lock().await;
        Ok(map.get(action).cloned())
    }

    #[instrument(skip(self, lease), fields(action = %lease.action), level = "trace")]
    async fn refresh(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, LockError> {
        let mut map = self.inner.lock().await;
        match map.get_mut(&lease.action) {
            Some(stored) if stored.token == lease.token && !stored.is_expired(ttl) => {
                stored.acquired_at = Utc::now();
                Ok(Some(stored.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, action: &str) -> Result<(), LockError> {
        let mut map = self.inner.lock().await;
        map.remove(action);
        Ok(())
    }

    async fn release_owned(&self, lease: &Lease) -> Result<bool, LockError> {
        let mut map = self.inner.lock().await;
        match map.get(&lease.action) {
            Some(stored) if stored.token == lease.token => {
                map.remove(&lease.action);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
