//! Higher-level storage operations.

use tracing::info;

use crate::error::StorageResult;
use crate::store::ObjectStore;

/// Maximum keys per delete request (S3 `DeleteObjects` limit).
pub const DELETE_BATCH_SIZE: usize = 1000;

/// Delete every object under `prefix`, in batches of [`DELETE_BATCH_SIZE`].
///
/// Returns the number of objects deleted.
pub async fn delete_prefix(store: &dyn ObjectStore, prefix: &str) -> StorageResult<u32> {
    let keys: Vec<String> = store
        .list(prefix)
        .await?
        .into_iter()
        .map(|o| o.key)
        .collect();

    if keys.is_empty() {
        return Ok(0);
    }

    let mut deleted = 0;
    for chunk in keys.chunks(DELETE_BATCH_SIZE) {
        deleted += store.delete_many(chunk).await?;
    }

    info!(prefix = %prefix, deleted, "Deleted objects under prefix");
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryObjectStore;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_delete_prefix_batches() {
        let store = MemoryObjectStore::new();
        for i in 0..2500 {
            store.insert(format!("job-1/frames/{:06}.png", i), vec![0u8]);
        }
        store.insert("job-2/frames/000001.png", vec![0u8]);

        let deleted = delete_prefix(&store, "job-1/").await.unwrap();

        assert_eq!(deleted, 2500);
        assert_eq!(store.counts().deletes.load(Ordering::SeqCst), 3);
        assert_eq!(store.keys(), vec!["job-2/frames/000001.png".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_empty_prefix_is_noop() {
        let store = MemoryObjectStore::new();
        assert_eq!(delete_prefix(&store, "missing/").await.unwrap(), 0);
        assert_eq!(store.counts().deletes.load(Ordering::SeqCst), 0);
    }
}
