//! Job store error types.

use thiserror::Error;
use upscale_models::{InvalidTransition, JobStage};

pub type JobStoreResult<T> = Result<T, JobStoreError>;

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job already exists: {0}")]
    AlreadyExists(String),

    /// The job was not in the expected stage. Callers re-read and decide;
    /// this is never retried blindly.
    #[error("Stage conflict for job {job_id}: expected {expected}, found {actual}")]
    StateConflict {
        job_id: String,
        expected: JobStage,
        actual: JobStage,
    },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Corrupt job record {0}: {1}")]
    Corrupt(String, String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl JobStoreError {
    pub fn not_found(job_id: impl Into<String>) -> Self {
        Self::NotFound(job_id.into())
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, JobStoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, JobStoreError::StateConflict { .. })
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            JobStoreError::ConnectionFailed(_) => true,
            JobStoreError::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_not_retryable() {
        let err = JobStoreError::StateConflict {
            job_id: "job-1".into(),
            expected: JobStage::Processing,
            actual: JobStage::Failed,
        };
        assert!(err.is_conflict());
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Stage conflict for job job-1: expected PROCESSING, found FAILED"
        );
    }

    #[test]
    fn test_connection_failures_are_retryable() {
        assert!(JobStoreError::connection_failed("refused").is_retryable());
        assert!(!JobStoreError::not_found("job-1").is_retryable());
    }
}
