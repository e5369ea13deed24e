//! Database cleanup.
//!
//! Each `Cleanup` item removes every row of one category, or optimizes every fragmented table.
//! Per-category counts for status displays are cached in the state store for a short while.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tasklane_core::state::{load, save};
use tasklane_core::{Outcome, StateStore, Task, TaskError};
use tracing::{debug, info, instrument, warn};

use crate::collaborators::Database;

const COUNTS_KEY: &str = "db_optimizer.counts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    ExpiredTransients,
    TrashedPosts,
    TrashedComments,
    SpamComments,
    Revisions,
    /// Non-InnoDB tables with overhead.
    TableFragmentation,
}

impl Category {
    /// Every category, in cleanup order.
    pub const ALL: [Category; 6] = [
        Category::ExpiredTransients,
        Category::TrashedPosts,
        Category::TrashedComments,
        Category::SpamComments,
        Category::Revisions,
        Category::TableFragmentation,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizeItem {
    Cleanup { category: Category },
}

#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// How long cached counts are served before the database is asked again.
    pub counts_ttl: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            counts_ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl OptimizerConfig {
    /// How long row counts are served from the state store.
    pub fn with_counts_ttl(mut self, ttl: Duration) -> Self {
        self.counts_ttl = ttl;
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedCounts {
    at: DateTime<Utc>,
    counts: BTreeMap<Category, usize>,
}

/// Task that cleans up one database category per item.
pub struct DbOptimizer<D, S> {
    db: Arc<D>,
    state: S,
    config: OptimizerConfig,
}

impl<D: Database, S: StateStore> DbOptimizer<D, S> {
    /// An optimizer with the default configuration.
    pub fn new(db: Arc<D>, state: S) -> Self {
        Self {
            db,
            state,
            config: OptimizerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OptimizerConfig) -> Self {
        self.config = config;
        self
    }

    /// Items for the selected categories, in the order they were given.
    pub fn items(categories: impl IntoIterator<Item = Category>) -> Vec<OptimizeItem> {
        categories
            .into_iter()
            .map(|category| OptimizeItem::Cleanup { category })
            .collect()
    }

    /// Rows per category, served from the state store while younger than the TTL.
    pub async fn counts(&self) -> Result<BTreeMap<Category, usize>, TaskError> {
        let cached: Option<CachedCounts> = load(&self.state, COUNTS_KEY).await?;
        let ttl = chrono::Duration::from_std(self.config.counts_ttl)
            .map_err(|e| TaskError::Generic(format!("counts TTL out of range: {e}")))?;
        if let Some(cached) = cached {
            if Utc::now() - cached.at < ttl {
                return Ok(cached.counts);
            }
        }

        let mut counts = BTreeMap::new();
        for category in Category::ALL {
            counts.insert(category, self.db.count(category).await?);
        }
        let fresh = CachedCounts {
            at: Utc::now(),
            counts,
        };
        save(&self.state, COUNTS_KEY, &fresh).await?;
        Ok(fresh.counts)
    }

    /// Drop cached counts so the next read hits the database.
    pub async fn invalidate_counts(&self) {
        if let Err(e) = self.state.delete(COUNTS_KEY).await {
            warn!(error = %e, "Could not drop cached counts");
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn cleanup(&self, category: Category) -> Result<(), TaskError> {
        let rows = self.db.fetch(category).await?;
        let mut failed = 0;
        for row in &rows {
            let result = match category {
                Category::TableFragmentation => self.db.optimize_table(row).await,
                _ => self.db.delete(category, row).await,
            };
            if let Err(e) = result {
                failed += 1;
                warn!(row = %row, error = %e, "Cleanup of row failed");
            }
        }
        debug!(rows = rows.len(), failed, "Category cleaned");
        self.invalidate_counts().await;
        Ok(())
    }
}

#[async_trait]
impl<D: Database, S: StateStore> Task for DbOptimizer<D, S> {
    type Item = OptimizeItem;

    async fn handle(&self, item: OptimizeItem) -> Result<Outcome<OptimizeItem>, TaskError> {
        let OptimizeItem::Cleanup { category } = item;
        self.cleanup(category).await?;
        Ok(Outcome::Done)
    }

    fn supported_options(&self) -> &'static [&'static str] {
        &[
            "database_revisions",
            "database_trashed_posts",
            "database_spam_comments",
            "database_trashed_comments",
            "database_expired_transients",
            "database_optimize_tables",
        ]
    }

    async fn on_complete(&self, action: &str) {
        info!(action, "Database optimization finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::CollaboratorError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tasklane_core::InMemoryStateStore;

    #[derive(Default)]
    struct FakeDb {
        rows: Mutex<HashMap<Category, Vec<String>>>,
        optimized: Mutex<Vec<String>>,
        count_calls: AtomicUsize,
    }

    impl FakeDb {
        fn with_rows(category: Category, rows: &[&str]) -> Self {
            let db = Self::default();
            db.rows
                .lock()
                .unwrap()
                .insert(category, rows.iter().map(|r| r.to_string()).collect());
            db
        }
    }

    #[async_trait]
    impl Database for FakeDb {
        async fn count(&self, category: Category) -> Result<usize, CollaboratorError> {
            self.count_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.rows.lock().unwrap().get(&category).map_or(0, Vec::len))
        }

        async fn fetch(&self, category: Category) -> Result<Vec<String>, CollaboratorError> {
            Ok(self.rows.lock().unwrap().get(&category).cloned().unwrap_or_default())
        }

        async fn delete(&self, category: Category, row: &str) -> Result<(), CollaboratorError> {
            if row == "locked" {
                return Err(CollaboratorError::Database("row is locked".into()));
            }
            if let Some(rows) = self.rows.lock().unwrap().get_mut(&category) {
                rows.retain(|r| r != row);
            }
            Ok(())
        }

        async fn optimize_table(&self, table: &str) -> Result<(), CollaboratorError> {
            self.optimized.lock().unwrap().push(table.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn cleanup_deletes_rows_and_keeps_going_past_failures() {
        let db = Arc::new(FakeDb::with_rows(Category::Revisions, &["1", "locked", "3"]));
        let optimizer = DbOptimizer::new(db.clone(), InMemoryStateStore::new());
        let item = OptimizeItem::Cleanup {
            category: Category::Revisions,
        };
        assert_eq!(optimizer.handle(item).await.unwrap(), Outcome::Done);
        assert_eq!(db.rows.lock().unwrap()[&Category::Revisions], vec!["locked"]);
    }

    #[tokio::test]
    async fn fragmented_tables_are_optimized() {
        let db = Arc::new(FakeDb::with_rows(Category::TableFragmentation, &["wp_options"]));
        let optimizer = DbOptimizer::new(db.clone(), InMemoryStateStore::new());
        let items =
            DbOptimizer::<FakeDb, InMemoryStateStore>::items([Category::TableFragmentation]);
        for item in items {
            optimizer.handle(item).await.unwrap();
        }
        assert_eq!(*db.optimized.lock().unwrap(), vec!["wp_options"]);
    }

    #[tokio::test]
    async fn counts_are_cached_within_the_ttl() {
        let db = Arc::new(FakeDb::with_rows(Category::SpamComments, &["7", "8"]));
        let optimizer = DbOptimizer::new(db.clone(), InMemoryStateStore::new());

        let counts = optimizer.counts().await.unwrap();
        assert_eq!(counts[&Category::SpamComments], 2);
        assert_eq!(counts[&Category::Revisions], 0);
        let calls = db.count_calls.load(Ordering::SeqCst);
        assert_eq!(calls, Category::ALL.len());

        optimizer.counts().await.unwrap();
        assert_eq!(db.count_calls.load(Ordering::SeqCst), calls);

        // A cleanup invalidates the cache.
        optimizer
            .handle(OptimizeItem::Cleanup {
                category: Category::SpamComments,
            })
            .await
            .unwrap();
        let counts = optimizer.counts().await.unwrap();
        assert_eq!(counts[&Category::SpamComments], 0);
        assert_eq!(db.count_calls.load(Ordering::SeqCst), calls * 2);
    }

    #[tokio::test]
    async fn zero_ttl_always_queries() {
        let db = Arc::new(FakeDb::default());
        let optimizer = DbOptimizer::new(db.clone(), InMemoryStateStore::new())
            .with_config(OptimizerConfig::default().with_counts_ttl(Duration::ZERO));
        optimizer.counts().await.unwrap();
        optimizer.counts().await.unwrap();
        assert_eq!(db.count_calls.load(Ordering::SeqCst), Category::ALL.len() * 2);
    }
}
