//! Pipeline driver.
//!
//! Moves one job through `INITIATED → EXTRACTING → PROCESSING → ENCODING →
//! COMPLETED`, resuming from whatever stage the job store reports. Batches
//! live in the durable fleet queue, so a restarted driver re-enters the
//! barrier without resubmitting them.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use upscale_fleet::{ExecutionFleet, FleetError};
use upscale_jobstore::{CounterField, JobMetadata, JobStore, JobStoreError};
use upscale_media::{VideoCodec, AUDIO_EXTENSION};
use upscale_models::{Batch, BatchStatus, Job, JobId, JobStage, ObjectLocation, Resolution};
use upscale_storage::{keys, BucketResolver, ObjectStore, StorageError};

use crate::artifact_cache::ArtifactCache;
use crate::config::PipelineConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::planner;
use crate::retry::RetryExecutor;
use crate::state_machine::JobStateMachine;

const AUDIO_CONTENT_TYPE: &str = "audio/x-matroska";
const VIDEO_CONTENT_TYPE: &str = "video/mp4";

/// Drives jobs through the pipeline stages.
pub struct PipelineDriver {
    config: PipelineConfig,
    jobs: Arc<dyn JobStore>,
    buckets: Arc<dyn BucketResolver>,
    fleet: Arc<dyn ExecutionFleet>,
    codec: Arc<dyn VideoCodec>,
    machine: JobStateMachine,
    retry: RetryExecutor,
}

impl PipelineDriver {
    pub fn new(
        config: PipelineConfig,
        jobs: Arc<dyn JobStore>,
        buckets: Arc<dyn BucketResolver>,
        fleet: Arc<dyn ExecutionFleet>,
        codec: Arc<dyn VideoCodec>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            machine: JobStateMachine::new(Arc::clone(&jobs), retry.clone()),
            config,
            jobs,
            buckets,
            fleet,
            codec,
            retry,
        }
    }

    pub fn state_machine(&self) -> &JobStateMachine {
        &self.machine
    }

    /// Run `job_id` to a terminal stage.
    ///
    /// Any error other than a lost stage race fails the job. Returns the
    /// job as last seen.
    pub async fn run(&self, job_id: &JobId) -> WorkerResult<Job> {
        let logger = JobLogger::new(job_id, "pipeline");
        let job = self.machine.get(job_id).await?;
        if job.is_terminal() {
            debug!(job_id = %job_id, stage = %job.stage, "Job already terminal");
            return Ok(job);
        }

        logger.log_start(&format!("{} from {}", job.video_name, job.stage));
        let result = self.drive(job).instrument(logger.create_span()).await;

        match result {
            Ok(job) => {
                if job.stage == JobStage::Completed {
                    logger.log_completion(&job.output_location);
                }
                Ok(job)
            }
            Err(e) if e.is_state_conflict() => {
                let job = self.machine.get(job_id).await?;
                if job.is_terminal() {
                    logger.log_warning(&format!("stopped by concurrent update: {}", e));
                    Ok(job)
                } else {
                    Err(e)
                }
            }
            Err(e) => {
                logger.log_error(&e.to_string());
                self.machine.fail(job_id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn drive(&self, mut job: Job) -> WorkerResult<Job> {
        let id = job.job_id.clone();

        if job.stage == JobStage::Initiated {
            job = self.machine.transition(&id, JobStage::Initiated, JobStage::Extracting).await?;
        }
        if job.stage == JobStage::Extracting {
            job = self.extract(&job).await?;
        }
        if matches!(job.stage, JobStage::Processing | JobStage::Interrupted) {
            let batches = self.batches_for(&job);
            job = self.await_batches(&job, &batches).await?;
            if job.stage != JobStage::Processing {
                return Ok(job);
            }
            job = self.machine.transition(&id, JobStage::Processing, JobStage::Encoding).await?;
        }
        if job.stage == JobStage::Encoding {
            job = self.encode(&job).await?;
        }
        Ok(job)
    }

    fn batches_for(&self, job: &Job) -> Vec<Batch> {
        let plan = planner::plan(job.frame_count, job.resolution);
        planner::partition(&job.job_id, job.frame_count, &plan, job.model_type)
    }

    fn intermediate(&self) -> Arc<dyn ObjectStore> {
        self.buckets.store_for(&self.config.processed_bucket)
    }

    fn cache_for(&self, bucket: &str) -> ArtifactCache {
        ArtifactCache::new(
            self.buckets.store_for(bucket),
            self.config.cache_dir.join(bucket),
            self.retry.clone(),
        )
    }

    fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.config.work_dir.join(job_id.as_str())
    }

    /// Extract frames and audio, plan and submit the batches, then move the
    /// job to `PROCESSING`.
    async fn extract(&self, job: &Job) -> WorkerResult<Job> {
        let source = ObjectLocation::parse(&job.source_location)?;
        let video = self.cache_for(&source.bucket).fetch(&source.key).await?;

        let info = self.codec.probe(&video).await?;
        info!(
            job_id = %job.job_id,
            width = info.width,
            height = info.height,
            fps = info.fps,
            frames = info.frame_count,
            audio = ?info.audio_codec,
            "Probed source video"
        );

        let job_dir = self.job_dir(&job.job_id);
        let frames_dir = job_dir.join("frames");
        if fs::try_exists(&frames_dir).await.unwrap_or(false) {
            fs::remove_dir_all(&frames_dir).await?;
        }
        let frames = self.codec.extract_frames(&video, &frames_dir).await?;
        if frames.is_empty() {
            return Err(WorkerError::extraction_failed("no frames extracted"));
        }
        let frame_count = frames.len() as u32;
        if frame_count != info.frame_count {
            warn!(
                job_id = %job.job_id,
                probed = info.frame_count,
                extracted = frame_count,
                "Frame count differs from probe"
            );
        }

        let resolution = Resolution::new(info.width, info.height);
        self.update_metadata(
            &job.job_id,
            JobMetadata {
                frame_count: Some(frame_count),
                resolution: Some(resolution),
                frame_rate: Some(info.fps),
                audio_codec: info.audio_codec.clone(),
                batch_count: None,
            },
        )
        .await?;

        let store = self.intermediate();
        stream::iter(frames)
            .map(|path| self.upload_source_frame(&store, &job.job_id, path))
            .buffer_unordered(self.config.transfer_concurrency)
            .try_collect::<Vec<()>>()
            .await?;

        if info.audio_codec.is_some() {
            let audio_path = job_dir.join(format!("audio.{}", AUDIO_EXTENSION));
            self.codec.extract_audio(&video, &audio_path).await?;
            let bytes = fs::read(&audio_path).await?;
            let key = keys::audio_key(job.job_id.as_str(), AUDIO_EXTENSION);
            self.put(&store, &key, bytes, AUDIO_CONTENT_TYPE).await?;
        }

        let job = self.machine.get(&job.job_id).await?;
        if !job.extraction_complete() {
            return Err(WorkerError::extraction_failed(format!(
                "extracted {} of {} frames",
                job.frames_extracted, job.frame_count
            )));
        }

        let plan = planner::plan(frame_count, resolution);
        let batches = planner::partition(&job.job_id, frame_count, &plan, job.model_type);
        info!(
            job_id = %job.job_id,
            batches = plan.total_batches,
            batch_size = plan.batch_size,
            memory_mb = plan.memory_mb,
            vcpus = plan.vcpus,
            "Planned batches"
        );
        self.update_metadata(
            &job.job_id,
            JobMetadata {
                batch_count: Some(plan.total_batches),
                ..Default::default()
            },
        )
        .await?;

        for batch in &batches {
            self.submit(batch).await?;
        }

        let _ = fs::remove_dir_all(&frames_dir).await;
        self.machine
            .transition(&job.job_id, JobStage::Extracting, JobStage::Processing)
            .await
    }

    async fn upload_source_frame(
        &self,
        store: &Arc<dyn ObjectStore>,
        job_id: &JobId,
        path: PathBuf,
    ) -> WorkerResult<()> {
        let frame = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(keys::frame_number)
            .ok_or_else(|| WorkerError::extraction_failed(format!("unexpected frame file {}", path.display())))?;

        let bytes = fs::read(&path).await?;
        let key = keys::source_frame_key(job_id.as_str(), frame);
        self.put(store, &key, bytes, keys::FRAME_CONTENT_TYPE).await?;

        self.retry
            .named("increment_extracted")
            .execute_if(
                || self.jobs.atomic_increment(job_id, CounterField::FramesExtracted, 1),
                JobStoreError::is_retryable,
            )
            .await?;
        Ok(())
    }

    /// Wait until every batch succeeded, resubmitting failed and
    /// interrupted ones.
    ///
    /// Returns the job once processing is complete, or as soon as it
    /// reached a terminal stage elsewhere.
    async fn await_batches(&self, job: &Job, batches: &[Batch]) -> WorkerResult<Job> {
        let job_id = &job.job_id;
        let by_index: HashMap<u32, &Batch> = batches.iter().map(|b| (b.index, b)).collect();
        let mut resubmits: HashMap<u32, u32> = HashMap::new();
        let mut unrecoverable: BTreeSet<u32> = BTreeSet::new();
        let deadline = Instant::now() + self.config.barrier_timeout;

        loop {
            let mut job = self.machine.get(job_id).await?;
            if job.is_terminal() {
                return Ok(job);
            }
            if job.stage == JobStage::Interrupted {
                job = self.try_resume(&job).await?;
            }

            if job.stage == JobStage::Processing {
                let outcomes = self
                    .retry
                    .named("batch_outcomes")
                    .execute_if(|| self.jobs.batch_outcomes(job_id), JobStoreError::is_retryable)
                    .await?;

                let mut succeeded = 0usize;
                for outcome in &outcomes {
                    let Some(batch) = by_index.get(&outcome.index) else {
                        continue;
                    };
                    match outcome.status {
                        BatchStatus::Succeeded => succeeded += 1,
                        BatchStatus::Interrupted => {
                            info!(job_id = %job_id, batch = outcome.index, "Resubmitting interrupted batch");
                            self.resubmit(batch).await?;
                        }
                        BatchStatus::Failed if unrecoverable.contains(&outcome.index) => {}
                        BatchStatus::Failed => {
                            let attempts = resubmits.entry(outcome.index).or_insert(0);
                            if *attempts < self.config.batch_resubmit_limit {
                                *attempts += 1;
                                warn!(
                                    job_id = %job_id,
                                    batch = outcome.index,
                                    attempt = *attempts,
                                    error = outcome.error.as_deref().unwrap_or(""),
                                    "Resubmitting failed batch"
                                );
                                self.resubmit(batch).await?;
                            } else {
                                warn!(job_id = %job_id, batch = outcome.index, "Batch failed permanently");
                                unrecoverable.insert(outcome.index);
                            }
                        }
                    }
                }

                if unrecoverable.len() as u32 > self.config.failed_batch_tolerance {
                    return Err(WorkerError::job_failed(format!(
                        "{} batches failed permanently: {:?}",
                        unrecoverable.len(),
                        unrecoverable
                    )));
                }

                if succeeded + unrecoverable.len() == batches.len() {
                    if !unrecoverable.is_empty() {
                        return Err(WorkerError::job_failed(format!(
                            "batches {:?} failed permanently",
                            unrecoverable
                        )));
                    }
                    let job = self.machine.get(job_id).await?;
                    if !job.processing_complete() {
                        return Err(WorkerError::job_failed(format!(
                            "all batches succeeded but only {} of {} frames recorded",
                            job.frames_processed, job.frame_count
                        )));
                    }
                    info!(job_id = %job_id, batches = batches.len(), "All batches succeeded");
                    return Ok(job);
                }

                debug!(
                    job_id = %job_id,
                    succeeded,
                    total = batches.len(),
                    frames_processed = job.frames_processed,
                    "Waiting for batches"
                );
            }

            if Instant::now() >= deadline {
                return Err(WorkerError::job_failed(format!(
                    "batches not done after {}s",
                    self.config.barrier_timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Resume an interrupted job once enough capacity is back.
    async fn try_resume(&self, job: &Job) -> WorkerResult<Job> {
        let capacity = self
            .retry
            .named("describe_capacity")
            .execute_if(
                || self.fleet.describe_capacity(&self.config.fleet_id),
                FleetError::is_retryable,
            )
            .await?;

        let effective = capacity.effective_fulfillment_percent();
        if effective < self.config.resume_fulfillment_percent {
            debug!(
                job_id = %job.job_id,
                effective_percent = effective,
                required_percent = self.config.resume_fulfillment_percent,
                "Waiting for capacity"
            );
            return Ok(job.clone());
        }

        info!(job_id = %job.job_id, effective_percent = effective, "Capacity restored, resuming");
        match self
            .machine
            .transition(&job.job_id, JobStage::Interrupted, JobStage::Processing)
            .await
        {
            Ok(job) => Ok(job),
            Err(e) if e.is_state_conflict() => self.machine.get(&job.job_id).await,
            Err(e) => Err(e),
        }
    }

    async fn resubmit(&self, batch: &Batch) -> WorkerResult<()> {
        self.retry
            .named("clear_batch_outcome")
            .execute_if(
                || self.jobs.clear_batch_outcome(&batch.job_id, batch.index),
                JobStoreError::is_retryable,
            )
            .await?;
        self.submit(batch).await
    }

    async fn submit(&self, batch: &Batch) -> WorkerResult<()> {
        let message_id = self
            .retry
            .named("submit_batch")
            .execute_if(|| self.fleet.submit(batch), FleetError::is_retryable)
            .await?;
        debug!(job_id = %batch.job_id, batch = batch.index, message_id = %message_id, "Submitted batch");
        Ok(())
    }

    /// Recompose the upscaled frames with the original audio and upload
    /// the result to the job's output location.
    async fn encode(&self, job: &Job) -> WorkerResult<Job> {
        let job_id = job.job_id.as_str();
        let cache = self.cache_for(&self.config.processed_bucket);

        {
            let cache = &cache;
            stream::iter(1..=job.frame_count)
                .map(|frame| async move { cache.fetch(&keys::upscaled_frame_key(job_id, frame)).await })
                .buffer_unordered(self.config.transfer_concurrency)
                .try_collect::<Vec<PathBuf>>()
                .await?;
        }
        let frames_dir = cache.local_path(&keys::upscaled_prefix(job_id))?;

        let audio = match &job.audio_codec {
            Some(_) => Some(cache.fetch(&keys::audio_key(job_id, AUDIO_EXTENSION)).await?),
            None => None,
        };

        let output_path = self.job_dir(&job.job_id).join("output.mp4");
        self.codec
            .encode(&frames_dir, job.frame_rate, audio.as_deref(), &output_path)
            .await
            .map_err(|e| WorkerError::encoding_failed(e.to_string()))?;

        let destination = ObjectLocation::parse(&job.output_location)?;
        let bytes = fs::read(&output_path).await?;
        let size = bytes.len();
        let store = self.buckets.store_for(&destination.bucket);
        self.put(&store, &destination.key, bytes, VIDEO_CONTENT_TYPE).await?;
        info!(job_id, output = %destination, bytes = size, "Uploaded output video");

        remove_dir(&self.job_dir(&job.job_id)).await;
        self.machine
            .transition(&job.job_id, JobStage::Encoding, JobStage::Completed)
            .await
    }

    async fn put(
        &self,
        store: &Arc<dyn ObjectStore>,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> WorkerResult<()> {
        self.retry
            .named("upload")
            .execute_if(
                || store.put(key, bytes.clone(), content_type),
                StorageError::is_retryable,
            )
            .await?;
        Ok(())
    }

    async fn update_metadata(&self, job_id: &JobId, metadata: JobMetadata) -> WorkerResult<()> {
        self.retry
            .named("update_metadata")
            .execute_if(
                || self.jobs.update_metadata(job_id, &metadata),
                JobStoreError::is_retryable,
            )
            .await?;
        Ok(())
    }
}

async fn remove_dir(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path).await {
        debug!(path = %path.display(), error = %e, "Failed to remove work dir");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use upscale_fleet::{BatchSource, MemoryFleet};
    use upscale_jobstore::MemoryJobStore;
    use upscale_media::{MediaResult, VideoInfo};
    use upscale_models::{BatchOutcome, ModelType};
    use upscale_storage::MemoryBuckets;

    /// Codec that is never reached by the barrier tests.
    struct UnusedCodec;

    #[async_trait]
    impl VideoCodec for UnusedCodec {
        async fn probe(&self, _video: &Path) -> MediaResult<VideoInfo> {
            unreachable!()
        }
        async fn extract_frames(&self, _video: &Path, _dir: &Path) -> MediaResult<Vec<PathBuf>> {
            unreachable!()
        }
        async fn extract_audio(&self, _video: &Path, _output: &Path) -> MediaResult<()> {
            unreachable!()
        }
        async fn encode(&self, _dir: &Path, _fps: f64, _audio: Option<&Path>, _output: &Path) -> MediaResult<()> {
            unreachable!()
        }
    }

    struct Harness {
        driver: PipelineDriver,
        jobs: Arc<MemoryJobStore>,
        fleet: Arc<MemoryFleet>,
        job: Job,
        batches: Vec<Batch>,
    }

    /// A job with 12 frames (3 batches of 5, 5, 2) already in PROCESSING,
    /// with its batches submitted.
    async fn harness(tolerance: u32) -> Harness {
        let jobs = Arc::new(MemoryJobStore::new());
        let fleet = Arc::new(MemoryFleet::new());
        fleet.set_capacity("spot", 10, 10);

        let job = Job::new("a.mp4", "s3://in/a.mp4", "s3://out/a.mp4", ModelType::default());
        jobs.create_job(&job).await.unwrap();
        jobs.update_metadata(
            &job.job_id,
            &JobMetadata {
                frame_count: Some(12),
                resolution: Some(Resolution::new(320, 240)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        jobs.atomic_increment(&job.job_id, CounterField::FramesExtracted, 12)
            .await
            .unwrap();
        jobs.force_stage(&job.job_id, JobStage::Processing);

        let config = PipelineConfig {
            fleet_id: "spot".to_string(),
            poll_interval: Duration::from_millis(5),
            barrier_timeout: Duration::from_secs(5),
            failed_batch_tolerance: tolerance,
            batch_resubmit_limit: 2,
            ..Default::default()
        };
        let retry = RetryExecutor::new("test").with_base_delay(Duration::from_millis(1));
        let driver = PipelineDriver::new(
            config,
            jobs.clone(),
            Arc::new(MemoryBuckets::new()),
            fleet.clone(),
            Arc::new(UnusedCodec),
            retry,
        );

        let job = jobs.get_job(&job.job_id).await.unwrap();
        let batches = driver.batches_for(&job);
        for batch in &batches {
            fleet.submit(batch).await.unwrap();
        }

        Harness {
            driver,
            jobs,
            fleet,
            job,
            batches,
        }
    }

    /// Play the fleet: run queued batches, letting `decide` pick each
    /// outcome from the batch and how often it has been delivered.
    fn simulate_workers(
        jobs: Arc<MemoryJobStore>,
        fleet: Arc<MemoryFleet>,
        decide: impl Fn(&Batch, u32) -> BatchStatus + Send + 'static,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut runs: HashMap<u32, u32> = HashMap::new();
            loop {
                while let Some(delivery) = fleet.pop() {
                    let batch = delivery.payload;
                    let run = runs.entry(batch.index).or_insert(0);
                    *run += 1;
                    let status = decide(&batch, *run);
                    if status == BatchStatus::Succeeded {
                        let frames: Vec<u32> = batch.frames().collect();
                        jobs.record_frames_processed(&batch.job_id, &frames).await.unwrap();
                    }
                    jobs.record_batch_outcome(&BatchOutcome::new(&batch, status, 0))
                        .await
                        .unwrap();
                    fleet.ack(&delivery.message_id).await.unwrap();
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    }

    fn submissions_of(fleet: &MemoryFleet, index: u32) -> usize {
        fleet.submitted().iter().filter(|b| b.index == index).count()
    }

    #[tokio::test]
    async fn test_all_batches_succeed() {
        let h = harness(0).await;
        let sim = simulate_workers(h.jobs.clone(), h.fleet.clone(), |_, _| BatchStatus::Succeeded);

        let job = h.driver.await_batches(&h.job, &h.batches).await.unwrap();
        sim.abort();

        assert_eq!(h.batches.len(), 3);
        assert!(job.processing_complete());
        assert_eq!(h.fleet.submitted().len(), 3);
    }

    #[tokio::test]
    async fn test_transient_batch_failure_is_resubmitted() {
        let h = harness(0).await;
        let sim = simulate_workers(h.jobs.clone(), h.fleet.clone(), |batch, run| {
            if batch.index == 1 && run == 1 {
                BatchStatus::Failed
            } else {
                BatchStatus::Succeeded
            }
        });

        let job = h.driver.await_batches(&h.job, &h.batches).await.unwrap();
        sim.abort();

        assert!(job.processing_complete());
        assert_eq!(submissions_of(&h.fleet, 1), 2);
    }

    #[tokio::test]
    async fn test_persistent_failure_exhausts_resubmits_and_fails() {
        let h = harness(0).await;
        let sim = simulate_workers(h.jobs.clone(), h.fleet.clone(), |batch, _| {
            if batch.index == 2 {
                BatchStatus::Failed
            } else {
                BatchStatus::Succeeded
            }
        });

        let err = h.driver.await_batches(&h.job, &h.batches).await.unwrap_err();
        sim.abort();

        assert!(matches!(err, WorkerError::JobFailed(_)));
        assert_eq!(submissions_of(&h.fleet, 2), 3);
    }

    #[tokio::test]
    async fn test_tolerated_failure_still_fails_when_barrier_settles() {
        let h = harness(1).await;
        let sim = simulate_workers(h.jobs.clone(), h.fleet.clone(), |batch, _| {
            if batch.index == 0 {
                BatchStatus::Failed
            } else {
                BatchStatus::Succeeded
            }
        });

        let err = h.driver.await_batches(&h.job, &h.batches).await.unwrap_err();
        sim.abort();

        assert_eq!(err.to_string(), "Job failed: batches {0} failed permanently");
    }

    #[tokio::test]
    async fn test_interrupted_job_waits_for_capacity() {
        let h = harness(0).await;
        h.fleet.set_capacity("spot", 2, 10);
        h.jobs.force_stage(&h.job.job_id, JobStage::Interrupted);
        let sim = simulate_workers(h.jobs.clone(), h.fleet.clone(), |batch, run| {
            if batch.index == 0 && run == 1 {
                BatchStatus::Interrupted
            } else {
                BatchStatus::Succeeded
            }
        });

        let fleet = h.fleet.clone();
        let restore = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fleet.set_capacity("spot", 6, 10);
        });

        let job = h.driver.await_batches(&h.job, &h.batches).await.unwrap();
        sim.abort();
        restore.await.unwrap();

        assert_eq!(job.stage, JobStage::Processing);
        assert!(job.processing_complete());
        assert_eq!(submissions_of(&h.fleet, 0), 2);
    }

    #[tokio::test]
    async fn test_barrier_times_out() {
        let mut h = harness(0).await;
        h.driver.config.barrier_timeout = Duration::from_millis(30);

        let err = h.driver.await_batches(&h.job, &h.batches).await.unwrap_err();
        assert!(err.to_string().contains("not done"));
    }

    #[tokio::test]
    async fn test_externally_failed_job_stops_barrier() {
        let h = harness(0).await;
        h.jobs.force_stage(&h.job.job_id, JobStage::Failed);

        let job = h.driver.await_batches(&h.job, &h.batches).await.unwrap();
        assert_eq!(job.stage, JobStage::Failed);
    }
}
