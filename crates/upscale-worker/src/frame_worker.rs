//! Frame processing worker.
//!
//! Runs one batch: for every frame, fetch the source frame through the
//! artifact cache, upscale it, upload the result and record it in the job
//! store. Frames already recorded by this execution or covered by the
//! latest checkpoint are skipped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::fs;
use tracing::{debug, info, warn};

use upscale_inference::{InferenceEndpoint, InferenceError, InferenceParams};
use upscale_jobstore::{JobStore, JobStoreError};
use upscale_models::{Batch, BatchResult, Checkpoint};
use upscale_storage::{keys, CheckpointStore, ObjectStore, StorageError};

use crate::artifact_cache::ArtifactCache;
use crate::error::WorkerResult;
use crate::logging::JobLogger;
use crate::metrics;
use crate::retry::RetryExecutor;
use crate::running::BatchHandle;

/// Processes batches of one intermediate bucket.
pub struct FrameWorker {
    store: Arc<dyn ObjectStore>,
    cache: ArtifactCache,
    inference: Arc<dyn InferenceEndpoint>,
    jobs: Arc<dyn JobStore>,
    checkpoints: CheckpointStore,
    retry: RetryExecutor,
    inference_max_attempts: u32,
    work_dir: PathBuf,
}

/// What happened to one frame.
enum FrameOutcome {
    Upscaled,
    Skipped,
}

impl FrameWorker {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        inference: Arc<dyn InferenceEndpoint>,
        jobs: Arc<dyn JobStore>,
        cache_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            cache: ArtifactCache::new(Arc::clone(&store), cache_dir, retry.clone()),
            checkpoints: CheckpointStore::new(Arc::clone(&store)),
            store,
            inference,
            jobs,
            inference_max_attempts: retry.max_attempts,
            retry,
            work_dir: work_dir.into(),
        }
    }

    pub fn with_inference_attempts(mut self, attempts: u32) -> Self {
        self.inference_max_attempts = attempts.max(1);
        self
    }

    /// Keys of upscaled frames this instance finished for `batch`.
    pub fn completed_keys(batch: &Batch, handle: &BatchHandle) -> Vec<String> {
        handle
            .completed_frames()
            .into_iter()
            .map(|frame| keys::upscaled_frame_key(batch.job_id.as_str(), frame))
            .collect()
    }

    /// Process every frame of `batch`, stopping early when `handle` is
    /// stopped.
    ///
    /// A frame that still fails after its retries is reported in
    /// `failed_frames`; the remaining frames are still attempted.
    pub async fn process(&self, batch: &Batch, handle: &BatchHandle) -> WorkerResult<BatchResult> {
        let logger = JobLogger::new(&batch.job_id, "process_batch");
        logger.log_start(&format!(
            "batch {} frames {}-{}",
            batch.index, batch.start_frame, batch.end_frame
        ));

        let job = self
            .retry
            .named("get_job")
            .execute_if(|| self.jobs.get_job(&batch.job_id), JobStoreError::is_retryable)
            .await?;
        let params = InferenceParams::for_resolution(batch.model_type, job.resolution);

        let checkpoint = self
            .retry
            .named("checkpoint_latest")
            .execute_if(|| self.checkpoints.latest(&batch.job_id), StorageError::is_retryable)
            .await?;
        if let Some(cp) = &checkpoint {
            info!(
                job_id = %batch.job_id,
                checkpoint = %cp.checkpoint_id,
                entries = cp.manifest.len(),
                "Resuming from checkpoint"
            );
        }

        let out_dir = self.batch_dir(batch);
        fs::create_dir_all(&out_dir).await?;

        let stop = handle.stop_signal();
        let mut result = BatchResult::default();

        for frame in batch.frames() {
            if *stop.borrow() {
                logger.log_warning(&format!("stopped before frame {}", frame));
                result.interrupted = true;
                break;
            }

            match self
                .process_frame(batch, frame, &params, checkpoint.as_ref(), handle, &out_dir)
                .await
            {
                Ok(FrameOutcome::Upscaled) | Ok(FrameOutcome::Skipped) => result.frames_done += 1,
                Err(e) => {
                    warn!(job_id = %batch.job_id, frame, error = %e, "Frame failed");
                    metrics::record_frame_failure();
                    result.failed_frames.push(frame);
                }
            }
        }

        result.success =
            !result.interrupted && result.failed_frames.is_empty() && result.frames_done == batch.frame_count();

        if let Err(e) = fs::remove_dir_all(&out_dir).await {
            debug!(path = %out_dir.display(), error = %e, "Failed to clean batch dir");
        }

        if result.success {
            logger.log_completion(&format!("batch {} done, {} frames", batch.index, result.frames_done));
        } else {
            logger.log_progress(&format!(
                "batch {} ended: {} done, {} failed, interrupted={}",
                batch.index,
                result.frames_done,
                result.failed_frames.len(),
                result.interrupted
            ));
        }
        Ok(result)
    }

    async fn process_frame(
        &self,
        batch: &Batch,
        frame: u32,
        params: &InferenceParams,
        checkpoint: Option<&Checkpoint>,
        handle: &BatchHandle,
        out_dir: &Path,
    ) -> WorkerResult<FrameOutcome> {
        let job_id = batch.job_id.as_str();
        let upscaled_key = keys::upscaled_frame_key(job_id, frame);

        if handle.is_completed(frame) {
            return Ok(FrameOutcome::Skipped);
        }

        if checkpoint.is_some_and(|cp| cp.contains(&upscaled_key)) {
            let uploaded = self
                .retry
                .named("exists")
                .execute_if(|| self.store.exists(&upscaled_key), StorageError::is_retryable)
                .await?;
            if uploaded {
                debug!(job_id, frame, "Frame covered by checkpoint");
                self.record_processed(batch, frame).await?;
                handle.mark_completed(frame);
                return Ok(FrameOutcome::Skipped);
            }
        }

        let started = Instant::now();
        let input = self.cache.fetch(&keys::source_frame_key(job_id, frame)).await?;
        let output = out_dir.join(keys::frame_file_name(frame));

        let upscaled = self
            .retry
            .named("inference")
            .with_max_attempts(self.inference_max_attempts)
            .execute_if(
                || self.inference.infer(&input, &output, params),
                InferenceError::is_retryable,
            )
            .await?;

        let bytes = fs::read(&upscaled).await?;
        self.retry
            .named("upload_frame")
            .execute_if(
                || self.store.put(&upscaled_key, bytes.clone(), keys::FRAME_CONTENT_TYPE),
                StorageError::is_retryable,
            )
            .await?;

        self.record_processed(batch, frame).await?;
        handle.mark_completed(frame);
        metrics::record_frame_processed(started.elapsed().as_secs_f64());

        let _ = fs::remove_file(&upscaled).await;
        Ok(FrameOutcome::Upscaled)
    }

    async fn record_processed(&self, batch: &Batch, frame: u32) -> WorkerResult<()> {
        let frames = [frame];
        self.retry
            .named("record_frames_processed")
            .execute_if(
                || self.jobs.record_frames_processed(&batch.job_id, &frames),
                JobStoreError::is_retryable,
            )
            .await?;
        Ok(())
    }

    fn batch_dir(&self, batch: &Batch) -> PathBuf {
        self.work_dir
            .join(batch.job_id.as_str())
            .join(format!("batch-{}", batch.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use upscale_inference::InferenceResult;
    use upscale_jobstore::{JobMetadata, MemoryJobStore};
    use upscale_models::{Job, JobId, ModelType, Resolution};
    use upscale_storage::MemoryObjectStore;

    /// Copies the input to the output, failing frames listed in `broken`.
    #[derive(Default)]
    struct CopyEndpoint {
        broken: HashSet<String>,
        calls: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl InferenceEndpoint for CopyEndpoint {
        async fn infer(
            &self,
            input_path: &Path,
            output_path: &Path,
            _params: &InferenceParams,
        ) -> InferenceResult<PathBuf> {
            self.calls.lock().unwrap().push(input_path.to_path_buf());
            let name = input_path.file_name().unwrap().to_string_lossy().to_string();
            if self.broken.contains(&name) {
                return Err(InferenceError::endpoint(500, "CUDA out of memory"));
            }
            let io = |e: std::io::Error| InferenceError::InvalidResponse(e.to_string());
            let mut bytes = tokio::fs::read(input_path).await.map_err(io)?;
            bytes.extend_from_slice(b"-x4");
            tokio::fs::write(output_path, bytes).await.map_err(io)?;
            Ok(output_path.to_path_buf())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MemoryObjectStore>,
        jobs: Arc<MemoryJobStore>,
        endpoint: Arc<CopyEndpoint>,
        worker: FrameWorker,
        batch: Batch,
    }

    async fn fixture(broken: &[u32]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let jobs = Arc::new(MemoryJobStore::new());

        let job = Job::with_id(
            JobId::from_string("job"),
            "a.mp4",
            "s3://in/a.mp4",
            "s3://out/a.mp4",
            ModelType::default(),
        );
        jobs.create_job(&job).await.unwrap();
        jobs.update_metadata(
            &job.job_id,
            &JobMetadata {
                frame_count: Some(5),
                resolution: Some(Resolution::new(640, 360)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        for frame in 1..=5 {
            store.insert(keys::source_frame_key("job", frame), format!("frame-{}", frame));
        }

        let endpoint = Arc::new(CopyEndpoint {
            broken: broken.iter().map(|f| keys::frame_file_name(*f)).collect(),
            ..Default::default()
        });
        let retry = RetryExecutor::new("test").with_base_delay(Duration::from_millis(1));
        let worker = FrameWorker::new(
            store.clone(),
            endpoint.clone(),
            jobs.clone(),
            dir.path().join("cache"),
            dir.path().join("work"),
            retry,
        );

        let batch = Batch {
            job_id: job.job_id.clone(),
            index: 0,
            start_frame: 1,
            end_frame: 5,
            vcpus: 2,
            memory_mb: 2048,
            model_type: ModelType::default(),
        };

        Fixture {
            _dir: dir,
            store,
            jobs,
            endpoint,
            worker,
            batch,
        }
    }

    #[tokio::test]
    async fn test_batch_uploads_every_frame() {
        let f = fixture(&[]).await;
        let handle = BatchHandle::new(f.batch.clone());

        let result = f.worker.process(&f.batch, &handle).await.unwrap();

        assert!(result.success);
        assert_eq!(result.frames_done, 5);
        assert_eq!(f.store.bytes(&keys::upscaled_frame_key("job", 3)).unwrap(), b"frame-3-x4");
        assert_eq!(f.jobs.get_job(&f.batch.job_id).await.unwrap().frames_processed, 5);
        assert_eq!(handle.completed_frames(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_failed_frame_does_not_stop_the_batch() {
        let f = fixture(&[2]).await;
        let handle = BatchHandle::new(f.batch.clone());

        let result = f.worker.process(&f.batch, &handle).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.failed_frames, vec![2]);
        assert_eq!(result.frames_done, 4);
        // three attempts for frame 2, one for each of the others
        assert_eq!(f.endpoint.calls.lock().unwrap().len(), 7);
        assert!(!f.store.contains(&keys::upscaled_frame_key("job", 2)));
    }

    #[tokio::test]
    async fn test_reprocessing_does_not_double_count() {
        let f = fixture(&[]).await;

        f.worker.process(&f.batch, &BatchHandle::new(f.batch.clone())).await.unwrap();
        f.worker.process(&f.batch, &BatchHandle::new(f.batch.clone())).await.unwrap();

        assert_eq!(f.jobs.get_job(&f.batch.job_id).await.unwrap().frames_processed, 5);
        assert_eq!(f.jobs.completed_frame_count(&f.batch.job_id), 5);
    }

    #[tokio::test]
    async fn test_checkpointed_frames_are_skipped() {
        let f = fixture(&[]).await;
        for frame in [1, 2] {
            f.store.insert(keys::upscaled_frame_key("job", frame), b"done".to_vec());
        }
        let checkpoint = Checkpoint::new(
            f.batch.job_id.clone(),
            "i-old",
            Some(0),
            vec![keys::upscaled_frame_key("job", 1), keys::upscaled_frame_key("job", 2)],
        );
        CheckpointStore::new(f.store.clone()).write(&checkpoint).await.unwrap();

        let result = f.worker.process(&f.batch, &BatchHandle::new(f.batch.clone())).await.unwrap();

        assert!(result.success);
        assert_eq!(result.frames_done, 5);
        assert_eq!(f.endpoint.calls.lock().unwrap().len(), 3);
        assert_eq!(f.store.bytes(&keys::upscaled_frame_key("job", 1)).unwrap(), b"done");
        assert_eq!(f.jobs.get_job(&f.batch.job_id).await.unwrap().frames_processed, 5);
    }

    #[tokio::test]
    async fn test_stopped_batch_is_interrupted() {
        let f = fixture(&[]).await;
        let handle = BatchHandle::new(f.batch.clone());
        handle.stop();

        let result = f.worker.process(&f.batch, &handle).await.unwrap();

        assert!(result.interrupted);
        assert_eq!(result.frames_done, 0);
        assert_eq!(result.status(), upscale_models::BatchStatus::Interrupted);
    }
}
