//! In-memory object store for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{StorageError, StorageResult};
use crate::store::{BucketResolver, ObjectInfo, ObjectStore, StoredObject};

/// Request counters, used to assert how much data a component moved.
#[derive(Debug, Default)]
pub struct RequestCounts {
    pub gets: AtomicU64,
    pub heads: AtomicU64,
    pub puts: AtomicU64,
    pub deletes: AtomicU64,
}

/// Object store backed by a `BTreeMap`. Version tags are content hashes.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, (Vec<u8>, String)>>,
    counts: RequestCounts,
    /// Remaining injected failures for `get`
    failing_gets: AtomicU64,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> &RequestCounts {
        &self.counts
    }

    pub fn gets(&self) -> u64 {
        self.counts.gets.load(Ordering::SeqCst)
    }

    pub fn heads(&self) -> u64 {
        self.counts.heads.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> u64 {
        self.counts.puts.load(Ordering::SeqCst)
    }

    /// Make the next `n` `get` calls fail with a transient error.
    pub fn fail_next_gets(&self, n: u64) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    /// Insert an object without counting it as a request.
    pub fn insert(&self, key: impl Into<String>, bytes: impl Into<Vec<u8>>) -> String {
        let bytes = bytes.into();
        let tag = fingerprint(&bytes);
        self.lock().insert(key.into(), (bytes, tag.clone()));
        tag
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).map(|(b, _)| b.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, (Vec<u8>, String)>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{:x}", digest)[..32].to_string()
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> StorageResult<StoredObject> {
        self.counts.gets.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failing_gets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::download_failed("injected failure"));
        }
        self.lock()
            .get(key)
            .map(|(bytes, tag)| StoredObject {
                bytes: bytes.clone(),
                version_tag: tag.clone(),
            })
            .ok_or_else(|| StorageError::not_found(key))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> StorageResult<String> {
        self.counts.puts.fetch_add(1, Ordering::SeqCst);
        let tag = fingerprint(&bytes);
        self.lock().insert(key.to_string(), (bytes, tag.clone()));
        Ok(tag)
    }

    async fn put_if_absent(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> StorageResult<bool> {
        self.counts.puts.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.lock();
        if objects.contains_key(key) {
            return Ok(false);
        }
        let tag = fingerprint(&bytes);
        objects.insert(key.to_string(), (bytes, tag));
        Ok(true)
    }

    async fn head(&self, key: &str) -> StorageResult<String> {
        self.counts.heads.fetch_add(1, Ordering::SeqCst);
        self.lock()
            .get(key)
            .map(|(_, tag)| tag.clone())
            .ok_or_else(|| StorageError::not_found(key))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectInfo>> {
        Ok(self
            .lock()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, (bytes, _))| ObjectInfo {
                key: k.clone(),
                size: bytes.len() as u64,
                last_modified: None,
            })
            .collect())
    }

    async fn delete_many(&self, keys: &[String]) -> StorageResult<u32> {
        self.counts.deletes.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.lock();
        for key in keys {
            objects.remove(key);
        }
        Ok(keys.len() as u32)
    }
}

/// Named in-memory buckets.
#[derive(Default)]
pub struct MemoryBuckets {
    buckets: Mutex<HashMap<String, Arc<MemoryObjectStore>>>,
}

impl MemoryBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str) -> Arc<MemoryObjectStore> {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(bucket.to_string())
            .or_default()
            .clone()
    }
}

impl BucketResolver for MemoryBuckets {
    fn store_for(&self, bucket: &str) -> Arc<dyn ObjectStore> {
        self.get(bucket)
    }
}
