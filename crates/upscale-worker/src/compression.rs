//! Gzip compression of intermediates of completed jobs.
//!
//! Completed jobs keep their frames until retention cleanup removes them.
//! Past `age_days` each object is replaced by a `.gz` copy so the bucket
//! holds the compressed form for the rest of the retention window.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use upscale_jobstore::{JobStore, JobStoreError};
use upscale_models::{JobId, JobStage};
use upscale_storage::{keys, ObjectStore, StorageError};

use crate::error::WorkerResult;
use crate::retry::RetryExecutor;

const GZIP_SUFFIX: &str = ".gz";

/// What one compression pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompressionReport {
    /// Objects compressed per job
    pub compressed: BTreeMap<String, u32>,
    /// Objects (or jobs) that could not be compressed
    pub errors: Vec<(String, String)>,
}

impl CompressionReport {
    pub fn total_compressed(&self) -> u32 {
        self.compressed.values().sum()
    }
}

pub struct IntermediateCompression {
    jobs: Arc<dyn JobStore>,
    store: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
}

impl IntermediateCompression {
    pub fn new(jobs: Arc<dyn JobStore>, store: Arc<dyn ObjectStore>, retry: RetryExecutor) -> Self {
        Self { jobs, store, retry }
    }

    /// Compress every uncompressed object of jobs completed more than
    /// `age_days` ago.
    pub async fn compress(&self, age_days: u32) -> WorkerResult<CompressionReport> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(age_days));
        let jobs = self
            .retry
            .named("list_jobs")
            .execute_if(|| self.jobs.list_jobs(), JobStoreError::is_retryable)
            .await?;

        let mut report = CompressionReport::default();
        for job in jobs
            .iter()
            .filter(|job| job.stage == JobStage::Completed && job.updated_at < cutoff)
        {
            match self.compress_job(&job.job_id, &mut report).await {
                Ok(0) => {}
                Ok(count) => {
                    report.compressed.insert(job.job_id.to_string(), count);
                }
                Err(e) => report.errors.push((job.job_id.to_string(), e.to_string())),
            }
        }

        info!(
            jobs = report.compressed.len(),
            objects = report.total_compressed(),
            errors = report.errors.len(),
            "Intermediate compression finished"
        );
        Ok(report)
    }

    async fn compress_job(&self, job_id: &JobId, report: &mut CompressionReport) -> WorkerResult<u32> {
        let prefix = keys::job_prefix(job_id.as_str());
        let objects = self
            .retry
            .named("list_job_objects")
            .execute_if(|| self.store.list(&prefix), StorageError::is_retryable)
            .await?;

        let mut count = 0;
        for object in objects.iter().filter(|object| !object.key.ends_with(GZIP_SUFFIX)) {
            match self.compress_object(&object.key).await {
                Ok(()) => count += 1,
                Err(e) => {
                    warn!(job_id = %job_id, key = %object.key, error = %e, "Cannot compress object");
                    report.errors.push((object.key.clone(), e.to_string()));
                }
            }
        }
        Ok(count)
    }

    /// Upload `{key}.gz`, then delete the original.
    async fn compress_object(&self, key: &str) -> WorkerResult<()> {
        let object = self
            .retry
            .named("get_object")
            .execute_if(|| self.store.get(key), StorageError::is_retryable)
            .await?;
        let compressed = gzip(&object.bytes)?;
        let target = format!("{}{}", key, GZIP_SUFFIX);

        self.retry
            .named("put_compressed")
            .execute_if(
                || self.store.put(&target, compressed.clone(), keys::GZIP_CONTENT_TYPE),
                StorageError::is_retryable,
            )
            .await?;
        let originals = [key.to_string()];
        self.retry
            .named("delete_original")
            .execute_if(|| self.store.delete_many(&originals), StorageError::is_retryable)
            .await?;

        debug!(key, original = object.bytes.len(), compressed = compressed.len(), "Compressed object");
        Ok(())
    }

    /// Run [`compress`](Self::compress) every `interval` until shutdown.
    pub async fn run(&self, age_days: u32, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.compress(age_days).await {
                        warn!(error = %e, "Intermediate compression failed");
                    }
                }
            }
        }
    }
}

fn gzip(bytes: &[u8]) -> WorkerResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    use flate2::read::GzDecoder;
    use upscale_jobstore::MemoryJobStore;
    use upscale_models::{Job, ModelType};
    use upscale_storage::MemoryObjectStore;

    async fn job(jobs: &MemoryJobStore, id: &str, stage: JobStage) {
        let job = Job::with_id(
            JobId::from_string(id),
            "a.mp4",
            "s3://in/a.mp4",
            "s3://out/a.mp4",
            ModelType::default(),
        );
        jobs.create_job(&job).await.unwrap();
        jobs.force_stage(&job.job_id, stage);
    }

    #[tokio::test]
    async fn test_compress_replaces_objects_of_completed_jobs() {
        let jobs = Arc::new(MemoryJobStore::new());
        let store = Arc::new(MemoryObjectStore::new());
        job(&jobs, "done", JobStage::Completed).await;
        job(&jobs, "busy", JobStage::Processing).await;

        let frame = keys::upscaled_frame_key("done", 1);
        let checkpoint = keys::checkpoint_key("done", "20240101T000000.000Z", "i-1");
        store.insert(frame.clone(), b"frame bytes".to_vec());
        store.insert(checkpoint.clone(), vec![1, 2, 3]);
        store.insert(keys::source_frame_key("busy", 1), vec![1]);

        let retry = RetryExecutor::new("test").with_base_delay(Duration::from_millis(1));
        let compression = IntermediateCompression::new(jobs, store.clone(), retry);

        // age 0: anything completed before now qualifies
        let report = compression.compress(0).await.unwrap();

        assert_eq!(report.compressed.get("done"), Some(&1));
        assert!(report.errors.is_empty());
        assert!(!store.contains(&frame));
        assert!(store.contains(&checkpoint));
        assert!(store.contains(&keys::source_frame_key("busy", 1)));

        let gz = store.get(&format!("{}.gz", frame)).await.unwrap();
        let mut restored = Vec::new();
        GzDecoder::new(gz.bytes.as_slice()).read_to_end(&mut restored).unwrap();
        assert_eq!(restored, b"frame bytes");

        // second pass finds nothing left to compress
        let again = compression.compress(0).await.unwrap();
        assert_eq!(again.total_compressed(), 0);
    }

    #[tokio::test]
    async fn test_recent_jobs_are_not_compressed() {
        let jobs = Arc::new(MemoryJobStore::new());
        let store = Arc::new(MemoryObjectStore::new());
        job(&jobs, "done", JobStage::Completed).await;
        store.insert(keys::upscaled_frame_key("done", 1), vec![1]);

        let retry = RetryExecutor::new("test").with_base_delay(Duration::from_millis(1));
        let compression = IntermediateCompression::new(jobs, store.clone(), retry);
        let report = compression.compress(3).await.unwrap();

        assert!(report.compressed.is_empty());
        assert!(store.contains(&keys::upscaled_frame_key("done", 1)));
    }
}
