//! Job store interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use upscale_models::{
    BatchOutcome, FallbackDecision, InterruptionRecord, Job, JobId, JobStage, Resolution,
};

use crate::error::JobStoreResult;

/// Counters that only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterField {
    FramesExtracted,
    FramesProcessed,
}

impl CounterField {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterField::FramesExtracted => "frames_extracted",
            CounterField::FramesProcessed => "frames_processed",
        }
    }
}

/// Probe results and planning output written by the state machine driver.
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub frame_count: Option<u32>,
    pub resolution: Option<Resolution>,
    pub frame_rate: Option<f64>,
    pub audio_codec: Option<String>,
    pub batch_count: Option<u32>,
}

impl JobMetadata {
    /// Apply the set fields to a job.
    pub fn apply_to(&self, job: &mut Job) {
        if let Some(frame_count) = self.frame_count {
            job.frame_count = frame_count;
        }
        if let Some(resolution) = self.resolution {
            job.resolution = resolution;
        }
        if let Some(frame_rate) = self.frame_rate {
            job.frame_rate = frame_rate;
        }
        if let Some(codec) = &self.audio_codec {
            job.audio_codec = Some(codec.clone());
        }
        if let Some(batch_count) = self.batch_count {
            job.batch_count = batch_count;
        }
    }
}

/// Durable job metadata with the two atomic primitives the pipeline
/// relies on: conditional stage updates and counter increments.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `AlreadyExists` if the ID is taken.
    async fn create_job(&self, job: &Job) -> JobStoreResult<()>;

    async fn get_job(&self, job_id: &JobId) -> JobStoreResult<Job>;

    /// Move a job from `expected` to `new`.
    ///
    /// Fails with `InvalidTransition` if the state machine forbids the
    /// change, and with `StateConflict` if the stored stage differs from
    /// `expected`.
    async fn conditional_update_stage(
        &self,
        job_id: &JobId,
        expected: JobStage,
        new: JobStage,
    ) -> JobStoreResult<Job>;

    /// Atomically add `delta` to a counter, returning the new value.
    ///
    /// The result never exceeds the job's `frame_count` once it is known.
    async fn atomic_increment(
        &self,
        job_id: &JobId,
        field: CounterField,
        delta: u32,
    ) -> JobStoreResult<u32>;

    /// Mark frames as processed, counting each frame number once.
    ///
    /// Returns how many of `frames` were newly recorded.
    async fn record_frames_processed(&self, job_id: &JobId, frames: &[u32]) -> JobStoreResult<u32>;

    async fn update_metadata(&self, job_id: &JobId, metadata: &JobMetadata) -> JobStoreResult<()>;

    /// Store a batch outcome, replacing any earlier outcome for the same index.
    async fn record_batch_outcome(&self, outcome: &BatchOutcome) -> JobStoreResult<()>;

    /// Outcomes recorded so far, ordered by batch index.
    async fn batch_outcomes(&self, job_id: &JobId) -> JobStoreResult<Vec<BatchOutcome>>;

    /// Forget a batch outcome before the batch is resubmitted.
    async fn clear_batch_outcome(&self, job_id: &JobId, index: u32) -> JobStoreResult<()>;

    async fn record_interruption(
        &self,
        job_id: &JobId,
        interruption: &InterruptionRecord,
    ) -> JobStoreResult<()>;

    async fn record_fallback(&self, job_id: &JobId, decision: &FallbackDecision)
        -> JobStoreResult<()>;

    async fn set_error(&self, job_id: &JobId, message: &str) -> JobStoreResult<()>;

    async fn list_jobs(&self) -> JobStoreResult<Vec<Job>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use upscale_models::ModelType;

    #[test]
    fn test_metadata_applies_only_set_fields() {
        let mut job = Job::new("a.mp4", "s3://in/a.mp4", "s3://out/a.mp4", ModelType::default());
        job.frame_rate = 24.0;

        JobMetadata {
            frame_count: Some(300),
            resolution: Some(Resolution::new(1280, 720)),
            ..Default::default()
        }
        .apply_to(&mut job);

        assert_eq!(job.frame_count, 300);
        assert_eq!(job.resolution, Resolution::new(1280, 720));
        assert_eq!(job.frame_rate, 24.0);
        assert_eq!(job.batch_count, 0);
    }
}
