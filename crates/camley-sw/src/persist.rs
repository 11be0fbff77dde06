//! Cache storage persisted as a JSON snapshot on disk.

use crate::cache::{CacheEntry, CacheStorage, CacheStore};
use crate::ServiceWorkerError;
use async_trait::async_trait;
use camley_common::{CamleyError, ResultExt};
use camley_net::Request;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Cache store that rewrites its snapshot file after every mutation.
///
/// A mutation is applied to a copy of the storage, the copy is written to a
/// temporary file and renamed over the snapshot, and only then does the copy
/// replace the in-memory state. A failed write leaves both untouched.
#[derive(Debug)]
pub struct PersistentCacheStorage {
    path: PathBuf,
    storage: RwLock<CacheStorage>,
}

impl PersistentCacheStorage {
    /// Open the snapshot at `path`, starting empty if it does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ServiceWorkerError> {
        let path = path.into();
        let storage = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<CacheStorage>(&raw)
                .context(format!("parsing {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheStorage::new(),
            Err(e) => {
                return Err(CamleyError::cache_with_source(format!("reading {}", path.display()), e).into())
            }
        };

        info!(path = %path.display(), caches = storage.keys().len(), "Cache storage opened");

        Ok(Self {
            path,
            storage: RwLock::new(storage),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_snapshot(&self, storage: &CacheStorage) -> Result<(), ServiceWorkerError> {
        let json = serde_json::to_vec(storage).context("encoding cache snapshot")?;
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .context(format!("creating {}", dir.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .context(format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .context(format!("replacing {}", self.path.display()))?;
        debug!(path = %self.path.display(), "Cache snapshot written");
        Ok(())
    }

    async fn commit<R>(
        &self,
        mutate: impl FnOnce(&mut CacheStorage) -> R,
    ) -> Result<R, ServiceWorkerError> {
        let mut current = self.storage.write().await;
        let mut next = current.clone();
        let result = mutate(&mut next);
        self.write_snapshot(&next).await?;
        *current = next;
        Ok(result)
    }
}

#[async_trait]
impl CacheStore for PersistentCacheStorage {
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
        if self.storage.read().await.has(name) {
            return Ok(());
        }
        self.commit(|storage| {
            storage.open(name);
        })
        .await
    }

    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(self.storage.read().await.has(name))
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        Ok(self
            .storage
            .read()
            .await
            .keys()
            .into_iter()
            .map(String::from)
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        if !self.storage.read().await.has(name) {
            return Ok(false);
        }
        self.commit(|storage| storage.delete(name)).await
    }

    async fn match_request(
        &self,
        request: &Request,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        Ok(self.storage.read().await.match_request(request).cloned())
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError> {
        self.commit(|storage| storage.open(name).put(entry)).await
    }

    async fn put_all(
        &self,
        name: &str,
        entries: Vec<CacheEntry>,
    ) -> Result<(), ServiceWorkerError> {
        self.commit(|storage| storage.open(name).put_all(entries))
            .await
    }

    async fn entries(&self, name: &str) -> Result<Vec<CacheEntry>, ServiceWorkerError> {
        Ok(self
            .storage
            .read()
            .await
            .get(name)
            .map(|cache| cache.entries().into_iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use camley_net::{Response, Url};
    use http::StatusCode;

    fn entry(url: &str, body: &'static str) -> CacheEntry {
        let request = Request::get(Url::parse(url).unwrap());
        let response = Response::synthetic(StatusCode::OK, "text/plain", Bytes::from_static(body.as_bytes()));
        CacheEntry::capture(&request, &response)
    }

    #[tokio::test]
    async fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentCacheStorage::open(dir.path().join("caches.json"))
            .await
            .unwrap();
        assert!(store.keys().await.unwrap().is_empty());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("caches.json");

        {
            let store = PersistentCacheStorage::open(&path).await.unwrap();
            store
                .put_all(
                    "camley-transporte-v2.1",
                    vec![entry("https://example.com/", "home"), entry("https://example.com/login", "login")],
                )
                .await
                .unwrap();
        }

        let reopened = PersistentCacheStorage::open(&path).await.unwrap();
        assert_eq!(reopened.keys().await.unwrap(), vec!["camley-transporte-v2.1"]);
        assert_eq!(reopened.entries("camley-transporte-v2.1").await.unwrap().len(), 2);

        let request = Request::get(Url::parse("https://example.com/login").unwrap());
        let hit = reopened.match_request(&request).await.unwrap().unwrap();
        assert_eq!(hit.body, b"login");
    }

    #[tokio::test]
    async fn test_delete_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches.json");

        let store = PersistentCacheStorage::open(&path).await.unwrap();
        store.open("old").await.unwrap();
        store.open("new").await.unwrap();
        assert!(store.delete("old").await.unwrap());
        assert!(!store.delete("old").await.unwrap());

        let reopened = PersistentCacheStorage::open(&path).await.unwrap();
        assert_eq!(reopened.keys().await.unwrap(), vec!["new"]);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the snapshot file should be makes the rename fail.
        let path = dir.path().join("caches.json");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), "x").unwrap();

        let store = PersistentCacheStorage {
            path: path.clone(),
            storage: RwLock::new(CacheStorage::new()),
        };
        let result = store.put("v1", entry("https://example.com/", "home")).await;

        assert!(matches!(result, Err(ServiceWorkerError::CacheError(_))));
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches.json");
        std::fs::write(&path, "{ nope").unwrap();

        assert!(PersistentCacheStorage::open(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_unreadable_snapshot_is_a_cache_error() {
        let dir = tempfile::tempdir().unwrap();

        let err = PersistentCacheStorage::open(dir.path()).await.unwrap_err();
        match err {
            ServiceWorkerError::CacheError(message) => assert!(message.contains("reading")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
