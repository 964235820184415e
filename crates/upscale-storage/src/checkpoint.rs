//! Checkpoint manifests.
//!
//! Checkpoints are stored as gzip-compressed JSON under
//! `{job_id}/checkpoints/`. Writes are create-only, so a checkpoint is
//! never overwritten once it exists.

use std::io::{Read, Write};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info, warn};

use upscale_models::{Checkpoint, JobId};

use crate::error::{StorageError, StorageResult};
use crate::keys::{checkpoint_key, checkpoint_prefix, GZIP_JSON_CONTENT_TYPE};
use crate::store::ObjectStore;

/// Compress a checkpoint to gzip JSON bytes.
pub fn compress_checkpoint(checkpoint: &Checkpoint) -> StorageResult<Vec<u8>> {
    let json = serde_json::to_vec(checkpoint).map_err(|e| {
        StorageError::Serialization(format!("Failed to serialize checkpoint: {}", e))
    })?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| StorageError::Serialization(format!("Failed to gzip checkpoint: {}", e)))?;

    encoder.finish().map_err(|e| {
        StorageError::Serialization(format!("Failed to finish gzip encoding: {}", e))
    })
}

/// Decompress gzip JSON bytes to a checkpoint.
pub fn decompress_checkpoint(data: &[u8]) -> StorageResult<Checkpoint> {
    let mut decoder = GzDecoder::new(data);
    let mut json = String::new();
    decoder
        .read_to_string(&mut json)
        .map_err(|e| StorageError::Serialization(format!("Corrupt checkpoint: {}", e)))?;
    Ok(serde_json::from_str(&json)?)
}

/// Reads and writes checkpoints in the intermediate bucket.
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn ObjectStore>,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Persist a checkpoint, returning its key.
    ///
    /// Fails with `AlreadyExists` if a checkpoint with the same ID was
    /// already written by this instance.
    pub async fn write(&self, checkpoint: &Checkpoint) -> StorageResult<String> {
        let key = checkpoint_key(
            checkpoint.job_id.as_str(),
            checkpoint.checkpoint_id.as_str(),
            &checkpoint.instance_id,
        );
        let compressed = compress_checkpoint(checkpoint)?;
        let size = compressed.len();

        if !self
            .store
            .put_if_absent(&key, compressed, GZIP_JSON_CONTENT_TYPE)
            .await?
        {
            return Err(StorageError::AlreadyExists(key));
        }

        info!(
            key = %key,
            artifacts = checkpoint.manifest.len(),
            compressed_size = size,
            "Checkpoint written"
        );
        Ok(key)
    }

    /// Load the most recent readable checkpoint for a job.
    ///
    /// Corrupt checkpoints are skipped with a warning; the next older one
    /// is used instead.
    pub async fn latest(&self, job_id: &JobId) -> StorageResult<Option<Checkpoint>> {
        let mut keys: Vec<String> = self
            .store
            .list(&checkpoint_prefix(job_id.as_str()))
            .await?
            .into_iter()
            .map(|o| o.key)
            .filter(|k| k.ends_with(".json.gz"))
            .collect();
        keys.sort();

        for key in keys.iter().rev() {
            let object = match self.store.get(key).await {
                Ok(object) => object,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            match decompress_checkpoint(&object.bytes) {
                Ok(checkpoint) => {
                    debug!(key = %key, "Loaded checkpoint");
                    return Ok(Some(checkpoint));
                }
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable checkpoint"),
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryObjectStore;
    use chrono::{Duration, Utc};
    use upscale_models::CheckpointId;

    fn checkpoint(job: &str, instance: &str, manifest: &[&str]) -> Checkpoint {
        Checkpoint::new(
            JobId::from_string(job),
            instance,
            Some(0),
            manifest.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_compress_decompress() {
        let cp = checkpoint("job", "i-1", &["job/upscaled/000002.png", "job/upscaled/000001.png"]);
        let bytes = compress_checkpoint(&cp).unwrap();
        let restored = decompress_checkpoint(&bytes).unwrap();
        assert_eq!(restored, cp);
        assert!(restored.contains("job/upscaled/000001.png"));
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(decompress_checkpoint(b"not gzip data at all").is_err());
    }

    #[tokio::test]
    async fn test_write_is_create_only() {
        let store = Arc::new(MemoryObjectStore::new());
        let checkpoints = CheckpointStore::new(store.clone());
        let cp = checkpoint("job", "i-1", &["a"]);

        checkpoints.write(&cp).await.unwrap();
        let err = checkpoints.write(&cp).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_latest_picks_newest_readable() {
        let store = Arc::new(MemoryObjectStore::new());
        let checkpoints = CheckpointStore::new(store.clone());

        let mut old = checkpoint("job", "i-1", &["job/upscaled/000001.png"]);
        old.checkpoint_id = CheckpointId::from_timestamp(Utc::now() - Duration::minutes(5));
        let new = checkpoint("job", "i-2", &["job/upscaled/000001.png", "job/upscaled/000002.png"]);
        checkpoints.write(&old).await.unwrap();
        checkpoints.write(&new).await.unwrap();

        let latest = checkpoints.latest(&JobId::from_string("job")).await.unwrap().unwrap();
        assert_eq!(latest.instance_id, "i-2");

        // A corrupt newer checkpoint falls back to the next one
        store.insert(checkpoint_key("job", "99991231T000000.000Z", "i-3"), b"junk".to_vec());
        let latest = checkpoints.latest(&JobId::from_string("job")).await.unwrap().unwrap();
        assert_eq!(latest.instance_id, "i-2");
    }

    #[tokio::test]
    async fn test_latest_none_without_checkpoints() {
        let checkpoints = CheckpointStore::new(Arc::new(MemoryObjectStore::new()));
        assert!(checkpoints.latest(&JobId::from_string("job")).await.unwrap().is_none());
    }
}
