//! Filesystem page cache.
//!
//! Pages live at `<root>/<host>/<path segments>/index.html`, next to variants of the same page
//! such as `index-mobile.html` or `index.html_gzip`. Language variants live under
//! `<root>/<host>/<code>/`. Removing something that is already gone is not an error.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, instrument};

use crate::collaborators::{CacheBackend, CollaboratorError, PageCache};

const PAGE_FILE: &str = "index.html";
const PAGE_PREFIX: &str = "index";

#[derive(Debug, Clone)]
pub struct FsPageCache {
    root: PathBuf,
    lifespan: Duration,
}

impl FsPageCache {
    /// A cache rooted at `root` whose pages stay fresh for ten hours.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lifespan: Duration::from_secs(10 * 60 * 60),
        }
    }

    /// How long a page counts as fresh after it was written.
    pub fn with_lifespan(mut self, lifespan: Duration) -> Self {
        self.lifespan = lifespan;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the cached copy of `url`.
    pub fn page_dir(&self, url: &str) -> Result<PathBuf, CollaboratorError> {
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .unwrap_or(url);
        let rest = rest.split(['?', '#']).next().unwrap_or_default();
        self.checked_join(rest)
    }

    /// Join a relative path under the root, refusing anything that escapes it.
    fn checked_join(&self, relative: &str) -> Result<PathBuf, CollaboratorError> {
        let mut path = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(segment) => path.push(segment),
                Component::CurDir | Component::RootDir => {}
                _ => {
                    return Err(CollaboratorError::Invalid(format!(
                        "path escapes the cache root: {relative}"
                    )))
                }
            }
        }
        Ok(path)
    }
}

async fn remove_dir(path: &Path) -> Result<(), CollaboratorError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Removed cache directory");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl PageCache for FsPageCache {
    async fn is_fresh(&self, url: &str) -> Result<bool, CollaboratorError> {
        let file = self.page_dir(url)?.join(PAGE_FILE);
        let metadata = match tokio::fs::metadata(&file).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let age = SystemTime::now()
            .duration_since(metadata.modified()?)
            .unwrap_or_default();
        Ok(age < self.lifespan)
    }
}

#[async_trait]
impl CacheBackend for FsPageCache {
    #[instrument(skip(self), level = "debug")]
    async fn flush_all(&self) -> Result<(), CollaboratorError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                remove_dir(&entry.path()).await?;
            } else {
                match tokio::fs::remove_file(entry.path()).await {
                    Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn purge_directory(&self, path: &str) -> Result<(), CollaboratorError> {
        remove_dir(&self.checked_join(path)?).await
    }

    /// Delete the page files of `url`. Pages nested below it are kept.
    async fn purge_url(&self, url: &str) -> Result<(), CollaboratorError> {
        let dir = self.page_dir(url)?;
        if dir == self.root {
            return Err(CollaboratorError::Invalid(format!("not a page URL: {url}")));
        }
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let is_page = entry.file_name().to_string_lossy().starts_with(PAGE_PREFIX);
            if !is_page || !entry.file_type().await?.is_file() {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => debug!(path = %entry.path().display(), "Removed cached page"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn purge_language(&self, code: &str) -> Result<(), CollaboratorError> {
        if code.is_empty() || code.contains(['/', '\\', '.']) {
            return Err(CollaboratorError::Invalid(format!("bad language code: {code}")));
        }
        let mut hosts = match tokio::fs::read_dir(&self.root).await {
            Ok(hosts) => hosts,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(host) = hosts.next_entry().await? {
            if host.file_type().await?.is_dir() {
                remove_dir(&host.path().join(code)).await?;
            }
        }
        Ok(())
    }
}
