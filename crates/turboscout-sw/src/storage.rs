//! Named cache stores (`caches` / `Cache`), optionally persisted to disk.
//!
//! All stores live behind one lock. A store handle that outlives its store (deleted by a newer
//! generation's activation) is detached: reads miss and writes are dropped.
//!
//! When a root directory is configured, every mutation rewrites `<root>/<name>.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::try_join_all;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace, warn};
use turboscout_common::{retry_with_backoff, RetryConfig};
use turboscout_net::{Fetcher, Request, Response};
use url::Url;

use crate::cache::{CacheEntry, CacheKey};
use crate::{ServiceWorkerError, SwResult};

#[derive(Debug, Default)]
struct CacheContents {
    entries: HashMap<CacheKey, CacheEntry>,
}

#[derive(Serialize, Deserialize)]
struct PersistedCache {
    name: String,
    entries: Vec<CacheEntry>,
}

struct StorageInner {
    caches: RwLock<HashMap<String, CacheContents>>,
    root: Option<PathBuf>,
    persist_lock: Mutex<()>,
}

/// All cache stores of an origin.
#[derive(Clone)]
pub struct CacheStorage {
    inner: Arc<StorageInner>,
}

impl CacheStorage {
    /// Create in-memory cache storage.
    pub fn new() -> Self {
        Self::with_root(None, HashMap::new())
    }

    /// Open cache storage persisted under `root`, loading any stores already there.
    pub async fn open_dir(root: impl Into<PathBuf>) -> SwResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let mut caches = HashMap::new();
        let mut dir = tokio::fs::read_dir(&root).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<PersistedCache>(&raw) {
                Ok(persisted) => {
                    let entries = persisted
                        .entries
                        .into_iter()
                        .map(|e| (e.key(), e))
                        .collect();
                    caches.insert(persisted.name, CacheContents { entries });
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable cache file");
                }
            }
        }

        debug!(root = %root.display(), stores = caches.len(), "Cache storage loaded");
        Ok(Self::with_root(Some(root), caches))
    }

    fn with_root(root: Option<PathBuf>, caches: HashMap<String, CacheContents>) -> Self {
        Self {
            inner: Arc::new(StorageInner {
                caches: RwLock::new(caches),
                root,
                persist_lock: Mutex::new(()),
            }),
        }
    }

    /// Directory the stores are persisted to, if any.
    pub fn root(&self) -> Option<&Path> {
        self.inner.root.as_deref()
    }

    /// Open a store, creating it if it doesn't exist.
    pub async fn open(&self, name: &str) -> SwResult<Cache> {
        let created = {
            let mut caches = self.inner.caches.write().await;
            if caches.contains_key(name) {
                false
            } else {
                caches.insert(name.to_string(), CacheContents::default());
                true
            }
        };

        if created {
            debug!(cache = name, "Cache store created");
            self.persist(name).await?;
        }

        Ok(Cache {
            name: name.to_string(),
            storage: self.clone(),
        })
    }

    /// Check if a store exists.
    pub async fn has(&self, name: &str) -> bool {
        self.inner.caches.read().await.contains_key(name)
    }

    /// Delete a store. Returns whether it existed.
    pub async fn delete(&self, name: &str) -> SwResult<bool> {
        let removed = self.inner.caches.write().await.remove(name).is_some();
        if removed {
            debug!(cache = name, "Cache store deleted");
            self.persist(name).await?;
        }
        Ok(removed)
    }

    /// All store names, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Store names with their entry counts, sorted by name.
    pub async fn summary(&self) -> Vec<(String, usize)> {
        let mut summary: Vec<(String, usize)> = self
            .inner
            .caches
            .read()
            .await
            .iter()
            .map(|(name, contents)| (name.clone(), contents.entries.len()))
            .collect();
        summary.sort();
        summary
    }

    async fn persist(&self, name: &str) -> SwResult<()> {
        let Some(root) = self.inner.root.as_ref() else {
            return Ok(());
        };

        // Snapshot after taking the lock so the last writer always writes the latest state.
        let _guard = self.inner.persist_lock.lock().await;
        let snapshot = {
            let caches = self.inner.caches.read().await;
            caches.get(name).map(|contents| {
                let mut entries: Vec<CacheEntry> = contents.entries.values().cloned().collect();
                entries.sort_by(|a, b| (&a.url, &a.method).cmp(&(&b.url, &b.method)));
                PersistedCache {
                    name: name.to_string(),
                    entries,
                }
            })
        };

        let path = root.join(file_name(name));
        match snapshot {
            Some(persisted) => {
                let bytes = serde_json::to_vec_pretty(&persisted)
                    .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;
                let tmp = path.with_extension("json.tmp");
                tokio::fs::write(&tmp, bytes).await?;
                tokio::fs::rename(&tmp, &path).await?;
                trace!(path = %path.display(), "Cache store persisted");
            }
            None => match tokio::fs::remove_file(&path).await {
                Ok(()) => trace!(path = %path.display(), "Cache file removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }
}

impl Default for CacheStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CacheStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStorage")
            .field("root", &self.inner.root)
            .finish_non_exhaustive()
    }
}

/// Distinct store names always map to distinct files.
fn file_name(name: &str) -> String {
    format!("{}.json", urlencoding::encode(name))
}

/// Handle to one named store.
#[derive(Clone, Debug)]
pub struct Cache {
    name: String,
    storage: CacheStorage,
}

impl Cache {
    /// Store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a captured response.
    pub async fn match_request(&self, key: &CacheKey) -> Option<CacheEntry> {
        let caches = self.storage.inner.caches.read().await;
        caches.get(&self.name)?.entries.get(key).cloned()
    }

    /// Store a response snapshot under `key`, overwriting any previous one.
    ///
    /// Returns `false` when the store has been deleted.
    pub async fn put(&self, key: &CacheKey, response: &Response) -> SwResult<bool> {
        self.put_entry(CacheEntry::capture(key, response)).await
    }

    /// Store a prepared entry.
    pub async fn put_entry(&self, entry: CacheEntry) -> SwResult<bool> {
        let stored = {
            let mut caches = self.storage.inner.caches.write().await;
            match caches.get_mut(&self.name) {
                Some(contents) => {
                    trace!(cache = %self.name, key = %entry.key(), "Cache put");
                    contents.entries.insert(entry.key(), entry);
                    true
                }
                None => {
                    trace!(cache = %self.name, key = %entry.key(), "Dropping put to deleted store");
                    false
                }
            }
        };
        if stored {
            self.storage.persist(&self.name).await?;
        }
        Ok(stored)
    }

    /// Fetch every URL and store the results, or store nothing.
    ///
    /// Duplicate URLs are fetched once. Any network failure or non-2xx response aborts the
    /// whole batch. Returns the number of entries written.
    pub async fn add_all(
        &self,
        fetcher: &dyn Fetcher,
        urls: &[Url],
        retry: &RetryConfig,
    ) -> SwResult<usize> {
        let mut unique: Vec<&Url> = Vec::with_capacity(urls.len());
        for url in urls {
            if !unique.contains(&url) {
                unique.push(url);
            }
        }

        let entries =
            try_join_all(unique.iter().map(|url| fetch_for_cache(fetcher, url, retry))).await?;

        let count = entries.len();
        {
            let mut caches = self.storage.inner.caches.write().await;
            let contents = caches.get_mut(&self.name).ok_or_else(|| {
                ServiceWorkerError::CacheError(format!("store {} was deleted", self.name))
            })?;
            for entry in entries {
                contents.entries.insert(entry.key(), entry);
            }
        }
        self.storage.persist(&self.name).await?;

        debug!(cache = %self.name, count, "Batch precached");
        Ok(count)
    }

    /// Remove one entry. Returns whether it existed.
    pub async fn delete(&self, key: &CacheKey) -> SwResult<bool> {
        let removed = {
            let mut caches = self.storage.inner.caches.write().await;
            caches
                .get_mut(&self.name)
                .map(|contents| contents.entries.remove(key).is_some())
                .unwrap_or(false)
        };
        if removed {
            self.storage.persist(&self.name).await?;
        }
        Ok(removed)
    }

    /// All keys, sorted.
    pub async fn keys(&self) -> Vec<CacheKey> {
        let caches = self.storage.inner.caches.read().await;
        let mut keys: Vec<CacheKey> = caches
            .get(&self.name)
            .map(|contents| contents.entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        let caches = self.storage.inner.caches.read().await;
        caches
            .get(&self.name)
            .map(|contents| contents.entries.len())
            .unwrap_or(0)
    }

    /// Whether the store holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

async fn fetch_for_cache(
    fetcher: &dyn Fetcher,
    url: &Url,
    retry: &RetryConfig,
) -> SwResult<CacheEntry> {
    retry_with_backoff(retry, || async move {
        let request = Request::get(url.clone());
        let response = fetcher.fetch(&request).await?;
        if !response.ok() {
            return Err(ServiceWorkerError::NetworkError(format!(
                "{} returned {}",
                url, response.status
            )));
        }
        Ok(CacheEntry::capture(&CacheKey::for_request(&request), &response))
    })
    .await
}
