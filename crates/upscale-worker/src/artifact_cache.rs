//! Local artifact cache validated against remote fingerprints.
//!
//! Each cached object lives at `{root}/{remote_key}` with a JSON sidecar
//! `{root}/{remote_key}.cache.json` holding its [`CacheEntry`]. A hit costs
//! one `head` call and no data transfer. Entries are never evicted.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};

use upscale_models::CacheEntry;
use upscale_storage::{ObjectStore, StorageError};

use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::retry::RetryExecutor;

const SIDECAR_SUFFIX: &str = ".cache.json";

pub struct ArtifactCache {
    store: Arc<dyn ObjectStore>,
    root: PathBuf,
    retry: RetryExecutor,
}

impl ArtifactCache {
    pub fn new(store: Arc<dyn ObjectStore>, root: impl Into<PathBuf>, retry: RetryExecutor) -> Self {
        Self {
            store,
            root: root.into(),
            retry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where `remote_key` is (or would be) cached.
    ///
    /// Keys with absolute, `.` or `..` components are rejected, so every
    /// cached path stays under the root.
    pub fn local_path(&self, remote_key: &str) -> WorkerResult<PathBuf> {
        let mut path = self.root.clone();
        for component in Path::new(remote_key).components() {
            match component {
                Component::Normal(part) => path.push(part),
                _ => return Err(WorkerError::UnsafeCacheKey(remote_key.to_string())),
            }
        }
        if path == self.root {
            return Err(WorkerError::UnsafeCacheKey(remote_key.to_string()));
        }
        Ok(path)
    }

    fn sidecar_path(&self, remote_key: &str) -> WorkerResult<PathBuf> {
        let mut path = self.local_path(remote_key)?.into_os_string();
        path.push(SIDECAR_SUFFIX);
        Ok(PathBuf::from(path))
    }

    /// Return a local copy of `remote_key` matching the remote's current
    /// version.
    ///
    /// Fails with a transfer error if the object is missing or the download
    /// keeps failing.
    pub async fn fetch(&self, remote_key: &str) -> WorkerResult<PathBuf> {
        let sidecar = self.sidecar_path(remote_key)?;
        if let Some(entry) = self.load_entry(remote_key, &sidecar).await {
            let remote_tag = self
                .retry
                .named("cache_head")
                .execute_if(|| self.store.head(remote_key), StorageError::is_retryable)
                .await?;

            if entry.is_current(&remote_tag) && self.verify_local(&entry).await {
                debug!(key = %remote_key, "Cache hit");
                metrics::record_cache_hit();
                return Ok(entry.local_path);
            }
            debug!(key = %remote_key, "Cache entry stale");
        }

        metrics::record_cache_miss();
        self.download(remote_key, &sidecar).await
    }

    async fn download(&self, remote_key: &str, sidecar: &Path) -> WorkerResult<PathBuf> {
        let object = self
            .retry
            .named("cache_get")
            .execute_if(|| self.store.get(remote_key), StorageError::is_retryable)
            .await?;

        let local_path = self.local_path(remote_key)?;
        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let entry = CacheEntry {
            remote_key: remote_key.to_string(),
            version_tag: object.version_tag,
            local_path: local_path.clone(),
            sha256: sha256_hex(&object.bytes),
            size_bytes: object.bytes.len() as u64,
            fetched_at: Utc::now(),
        };

        write_atomic(&local_path, &object.bytes).await?;
        write_atomic(sidecar, &serde_json::to_vec_pretty(&entry)?).await?;

        debug!(key = %remote_key, bytes = entry.size_bytes, "Cached artifact");
        Ok(local_path)
    }

    async fn load_entry(&self, remote_key: &str, sidecar: &Path) -> Option<CacheEntry> {
        let raw = fs::read(sidecar).await.ok()?;
        match serde_json::from_slice::<CacheEntry>(&raw) {
            Ok(entry) if entry.remote_key == remote_key => Some(entry),
            Ok(_) => None,
            Err(e) => {
                warn!(key = %remote_key, error = %e, "Ignoring unreadable cache entry");
                None
            }
        }
    }

    /// The local bytes still hash to what was downloaded.
    async fn verify_local(&self, entry: &CacheEntry) -> bool {
        match fs::read(&entry.local_path).await {
            Ok(bytes) if sha256_hex(&bytes) == entry.sha256 => true,
            Ok(_) => {
                warn!(path = %entry.local_path.display(), "Cached file corrupted, refetching");
                false
            }
            Err(_) => false,
        }
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Write via a temp file in the same directory, then rename over `path`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use upscale_storage::MemoryObjectStore;

    use crate::error::WorkerError;

    fn cache(store: Arc<MemoryObjectStore>, dir: &Path) -> ArtifactCache {
        let retry = RetryExecutor::new("test").with_base_delay(Duration::from_millis(1));
        ArtifactCache::new(store, dir, retry)
    }

    #[tokio::test]
    async fn test_unchanged_entry_costs_one_head_and_no_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("job/frames/000001.png", b"frame-one".to_vec());
        let cache = cache(store.clone(), dir.path());

        let path = cache.fetch("job/frames/000001.png").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"frame-one");
        assert_eq!((store.gets(), store.heads()), (1, 0));

        let again = cache.fetch("job/frames/000001.png").await.unwrap();
        assert_eq!(again, path);
        assert_eq!((store.gets(), store.heads()), (1, 1));
    }

    #[tokio::test]
    async fn test_changed_remote_is_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("job/audio/audio.mka", b"v1".to_vec());
        let cache = cache(store.clone(), dir.path());

        cache.fetch("job/audio/audio.mka").await.unwrap();
        store.insert("job/audio/audio.mka", b"v2".to_vec());

        let path = cache.fetch("job/audio/audio.mka").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"v2");
        assert_eq!(store.gets(), 2);
    }

    #[tokio::test]
    async fn test_corrupted_local_copy_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("job/frames/000002.png", b"pristine".to_vec());
        let cache = cache(store.clone(), dir.path());

        let path = cache.fetch("job/frames/000002.png").await.unwrap();
        fs::write(&path, b"bit rot").await.unwrap();

        let path = cache.fetch("job/frames/000002.png").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"pristine");
        assert_eq!(store.gets(), 2);
    }

    #[tokio::test]
    async fn test_entries_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("job/frames/000003.png", b"abc".to_vec());

        cache(store.clone(), dir.path()).fetch("job/frames/000003.png").await.unwrap();
        cache(store.clone(), dir.path()).fetch("job/frames/000003.png").await.unwrap();

        assert_eq!(store.gets(), 1);
    }

    #[tokio::test]
    async fn test_transient_get_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("job/frames/000004.png", b"x".to_vec());
        store.fail_next_gets(2);

        let path = cache(store.clone(), dir.path())
            .fetch("job/frames/000004.png")
            .await
            .unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_keys_escaping_the_root_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("../outside.png", b"x".to_vec());
        store.insert("/etc/passwd", b"x".to_vec());
        let cache = cache(store.clone(), &root);

        for key in ["../outside.png", "/etc/passwd", "./job/frames/000001.png", "job/../../x", ""] {
            let err = cache.fetch(key).await.unwrap_err();
            assert!(matches!(err, WorkerError::UnsafeCacheKey(_)), "{key}: {err}");
        }
        assert_eq!(store.gets(), 0);
        assert!(!dir.path().join("outside.png").exists());

        let path = cache.local_path("job/upscaled/").unwrap();
        assert_eq!(path, root.join("job").join("upscaled"));
    }

    #[tokio::test]
    async fn test_missing_remote_fails_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());

        let err = cache(store.clone(), dir.path())
            .fetch("job/frames/999999.png")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Transfer(ref e) if e.is_not_found()));
        assert_eq!(store.gets(), 1);
    }
}
