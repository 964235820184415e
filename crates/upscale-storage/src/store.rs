//! Object store interface.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StorageResult;

/// Object bytes plus the fingerprint of the stored version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub version_tag: String,
}

/// Information about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object key
    pub key: String,
    /// Size in bytes
    pub size: u64,
    /// Last modified timestamp (milliseconds since epoch)
    pub last_modified: Option<u64>,
}

/// Durable blob store used by the cache, workers and checkpoints.
///
/// Keys are relative to the store's bucket. `version_tag` is a
/// content-derived fingerprint (an ETag for S3).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Download an object with its fingerprint.
    async fn get(&self, key: &str) -> StorageResult<StoredObject>;

    /// Upload an object, returning the new fingerprint.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> StorageResult<String>;

    /// Upload only if no object exists under `key`.
    ///
    /// Returns `false` when the key was already taken.
    async fn put_if_absent(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> StorageResult<bool>;

    /// Fingerprint of the current object. Fails with `NotFound` if missing.
    async fn head(&self, key: &str) -> StorageResult<String>;

    /// List objects under a prefix.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectInfo>>;

    /// Delete objects, returning how many were requested for deletion.
    async fn delete_many(&self, keys: &[String]) -> StorageResult<u32>;

    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Resolves per-bucket stores for locations outside the default bucket
/// (source uploads, final outputs).
pub trait BucketResolver: Send + Sync {
    fn store_for(&self, bucket: &str) -> Arc<dyn ObjectStore>;
}
