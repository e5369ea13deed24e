//! Task adapters for tasklane.
//!
//! - [`Preloader`] warms the page cache one URL at a time and crawls the site map.
//! - [`Purger`] removes cached pages through a [`CacheBackend`].
//! - [`DbOptimizer`] runs database cleanups category by category.
//!
//! The adapters only reach the outside world through the collaborator traits in
//! [`collaborators`], so hosts can plug in their own cache layout, fetcher and database.

pub mod collaborators;
pub mod fs_cache;
pub mod optimizer;
pub mod preloader;
pub mod purger;

pub use collaborators::{
    CacheBackend, CollaboratorError, Database, Fetcher, HttpFetcher, PageCache, SiteMap,
};
pub use fs_cache::FsPageCache;
pub use optimizer::{Category, DbOptimizer, OptimizeItem, OptimizerConfig};
pub use preloader::{FetchStage, PreloadItem, Preloader, PreloaderConfig};
pub use purger::{PurgeItem, Purger};

/// Action names the adapters are usually registered under.
pub mod actions {
    pub const CACHE_PRELOADER: &str = "cache_preloader";
    pub const CACHE_PURGER: &str = "cache_purger";
    pub const DB_OPTIMIZER: &str = "db_optimizer";
}
