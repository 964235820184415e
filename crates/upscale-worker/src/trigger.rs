//! Job creation from upload notifications.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use upscale_fleet::{FleetResult, JobRequest, StreamQueue};
use upscale_jobstore::{JobStore, JobStoreError};
use upscale_models::{Job, JobId, ModelType, ObjectLocation};

use crate::error::WorkerResult;
use crate::retry::RetryExecutor;

/// Video container extensions accepted by the pipeline.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv"];

/// Where new jobs are handed to the pipeline driver.
#[async_trait]
pub trait JobRequestSink: Send + Sync {
    async fn send(&self, request: &JobRequest) -> FleetResult<String>;
}

#[async_trait]
impl JobRequestSink for StreamQueue<JobRequest> {
    async fn send(&self, request: &JobRequest) -> FleetResult<String> {
        self.enqueue(request).await
    }
}

/// Whether `key` names a video the pipeline can process.
pub fn is_video_key(key: &str) -> bool {
    Path::new(key)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| VIDEO_EXTENSIONS.iter().any(|v| ext.eq_ignore_ascii_case(v)))
        .unwrap_or(false)
}

/// Output location of the final video for `job_id`.
pub fn output_location(output_bucket: &str, job_id: &JobId, key: &str) -> ObjectLocation {
    let stem = Path::new(key)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("video");
    ObjectLocation::new(output_bucket, format!("{}/{}_upscaled.mp4", job_id, stem))
}

pub struct PipelineTrigger {
    jobs: Arc<dyn JobStore>,
    sink: Arc<dyn JobRequestSink>,
    model_type: ModelType,
    retry: RetryExecutor,
}

impl PipelineTrigger {
    pub fn new(jobs: Arc<dyn JobStore>, sink: Arc<dyn JobRequestSink>, retry: RetryExecutor) -> Self {
        Self {
            jobs,
            sink,
            model_type: ModelType::default(),
            retry,
        }
    }

    pub fn with_model_type(mut self, model_type: ModelType) -> Self {
        self.model_type = model_type;
        self
    }

    /// Create a job for an uploaded video and queue it for the driver.
    ///
    /// Returns `None` for keys that are not videos.
    pub async fn handle_upload(&self, bucket: &str, key: &str, output_bucket: &str) -> WorkerResult<Option<Job>> {
        if !is_video_key(key) {
            warn!(bucket = %bucket, key = %key, "Ignoring non-video upload");
            return Ok(None);
        }

        let source = ObjectLocation::new(bucket, key);
        let job_id = JobId::new();
        let output = output_location(output_bucket, &job_id, key);
        let job = Job::with_id(
            job_id,
            source.file_name(),
            source.to_string(),
            output.to_string(),
            self.model_type,
        );

        self.retry
            .named("create_job")
            .execute_if(|| self.jobs.create_job(&job), JobStoreError::is_retryable)
            .await?;

        let request = JobRequest {
            job_id: job.job_id.clone(),
        };
        let message_id = self
            .retry
            .named("enqueue_job")
            .execute_if(|| self.sink.send(&request), upscale_fleet::FleetError::is_retryable)
            .await?;

        info!(
            job_id = %job.job_id,
            source = %job.source_location,
            output = %job.output_location,
            message_id = %message_id,
            "Job created"
        );
        Ok(Some(job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use upscale_jobstore::MemoryJobStore;
    use upscale_models::JobStage;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<JobRequest>>,
    }

    #[async_trait]
    impl JobRequestSink for RecordingSink {
        async fn send(&self, request: &JobRequest) -> FleetResult<String> {
            let mut sent = self.sent.lock().unwrap();
            sent.push(request.clone());
            Ok(format!("{}-0", sent.len()))
        }
    }

    fn trigger() -> (PipelineTrigger, Arc<MemoryJobStore>, Arc<RecordingSink>) {
        let jobs = Arc::new(MemoryJobStore::new());
        let sink = Arc::new(RecordingSink::default());
        let retry = RetryExecutor::new("test").with_base_delay(Duration::from_millis(1));
        (PipelineTrigger::new(jobs.clone(), sink.clone(), retry), jobs, sink)
    }

    #[test]
    fn test_video_extensions() {
        assert!(is_video_key("uploads/clip.mp4"));
        assert!(is_video_key("uploads/CLIP.MKV"));
        assert!(is_video_key("a.Mov"));
        assert!(!is_video_key("notes.txt"));
        assert!(!is_video_key("mp4"));
    }

    #[tokio::test]
    async fn test_upload_creates_and_queues_job() {
        let (trigger, jobs, sink) = trigger();

        let job = trigger
            .handle_upload("raw", "uploads/holiday.mov", "final")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(job.stage, JobStage::Initiated);
        assert_eq!(job.video_name, "holiday.mov");
        assert_eq!(job.source_location, "s3://raw/uploads/holiday.mov");
        assert_eq!(
            job.output_location,
            format!("s3://final/{}/holiday_upscaled.mp4", job.job_id)
        );

        let stored = jobs.get_job(&job.job_id).await.unwrap();
        assert_eq!(stored.job_id, job.job_id);
        assert_eq!(sink.sent.lock().unwrap()[0].job_id, job.job_id);
    }

    #[tokio::test]
    async fn test_non_video_is_ignored() {
        let (trigger, jobs, sink) = trigger();

        let job = trigger.handle_upload("raw", "readme.txt", "final").await.unwrap();

        assert!(job.is_none());
        assert!(jobs.list_jobs().await.unwrap().is_empty());
        assert!(sink.sent.lock().unwrap().is_empty());
    }
}
