//! Guarded stage transitions on top of the job store.

use std::sync::Arc;

use tracing::{info, warn};

use upscale_jobstore::{JobStore, JobStoreError};
use upscale_models::{Job, JobId, JobStage};

use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::retry::RetryExecutor;

/// Attempts at moving a job to `FAILED` while other writers change its stage.
const FAIL_ATTEMPTS: u32 = 3;

/// Applies stage transitions with compare-and-set semantics.
///
/// A transition only succeeds when the stored stage still equals the
/// expected one; otherwise the caller gets a `StateConflict` and decides
/// what to do after re-reading the job.
#[derive(Clone)]
pub struct JobStateMachine {
    jobs: Arc<dyn JobStore>,
    retry: RetryExecutor,
}

impl JobStateMachine {
    pub fn new(jobs: Arc<dyn JobStore>, retry: RetryExecutor) -> Self {
        Self { jobs, retry }
    }

    pub async fn get(&self, job_id: &JobId) -> WorkerResult<Job> {
        Ok(self
            .retry
            .named("get_job")
            .execute_if(|| self.jobs.get_job(job_id), JobStoreError::is_retryable)
            .await?)
    }

    /// Move `job_id` from `expected` to `new`.
    pub async fn transition(&self, job_id: &JobId, expected: JobStage, new: JobStage) -> WorkerResult<Job> {
        let job = self
            .retry
            .named("update_stage")
            .execute_if(
                || self.jobs.conditional_update_stage(job_id, expected, new),
                JobStoreError::is_retryable,
            )
            .await?;

        info!(job_id = %job_id, from = %expected, to = %new, "Stage transition");
        metrics::record_stage_transition(expected, new);
        Ok(job)
    }

    /// Record `message` and move the job to `FAILED` from whatever
    /// non-terminal stage it is in. Terminal jobs are returned unchanged.
    pub async fn fail(&self, job_id: &JobId, message: &str) -> WorkerResult<Job> {
        self.retry
            .named("set_error")
            .execute_if(|| self.jobs.set_error(job_id, message), JobStoreError::is_retryable)
            .await?;

        let mut last_conflict = None;
        for _ in 0..FAIL_ATTEMPTS {
            let job = self.get(job_id).await?;
            if job.is_terminal() {
                return Ok(job);
            }
            match self.transition(job_id, job.stage, JobStage::Failed).await {
                Ok(job) => {
                    warn!(job_id = %job_id, error = %message, "Job failed");
                    return Ok(job);
                }
                Err(e) if e.is_state_conflict() => last_conflict = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_conflict.unwrap_or_else(|| WorkerError::job_failed(message)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use upscale_jobstore::MemoryJobStore;
    use upscale_models::ModelType;

    async fn machine() -> (JobStateMachine, Arc<MemoryJobStore>, JobId) {
        let jobs = Arc::new(MemoryJobStore::new());
        let job = Job::new("a.mp4", "s3://in/a.mp4", "s3://out/a.mp4", ModelType::default());
        jobs.create_job(&job).await.unwrap();
        let retry = RetryExecutor::new("test").with_base_delay(Duration::from_millis(1));
        (JobStateMachine::new(jobs.clone(), retry), jobs, job.job_id)
    }

    #[tokio::test]
    async fn test_transition_requires_expected_stage() {
        let (machine, _, id) = machine().await;

        let job = machine
            .transition(&id, JobStage::Initiated, JobStage::Extracting)
            .await
            .unwrap();
        assert_eq!(job.stage, JobStage::Extracting);

        let err = machine
            .transition(&id, JobStage::Initiated, JobStage::Extracting)
            .await
            .unwrap_err();
        assert!(err.is_state_conflict());
    }

    #[tokio::test]
    async fn test_fail_from_any_stage() {
        let (machine, jobs, id) = machine().await;
        jobs.force_stage(&id, JobStage::Interrupted);

        let job = machine.fail(&id, "too many failed batches").await.unwrap();
        assert_eq!(job.stage, JobStage::Failed);
        assert_eq!(job.error_message.as_deref(), Some("too many failed batches"));

        // already terminal
        let job = machine.fail(&id, "again").await.unwrap();
        assert_eq!(job.stage, JobStage::Failed);
    }

    #[tokio::test]
    async fn test_completed_job_is_not_failed() {
        let (machine, jobs, id) = machine().await;
        jobs.force_stage(&id, JobStage::Completed);

        let job = machine.fail(&id, "late error").await.unwrap();
        assert_eq!(job.stage, JobStage::Completed);
    }
}
