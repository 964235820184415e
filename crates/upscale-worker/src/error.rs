//! Worker error types.

use thiserror::Error;

use upscale_jobstore::JobStoreError;
use upscale_models::{JobId, JobStage};

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// Object store I/O failed (or the object is missing).
    #[error("Transfer failed: {0}")]
    Transfer(#[from] upscale_storage::StorageError),

    #[error("Inference failed: {0}")]
    Inference(#[from] upscale_inference::InferenceError),

    /// The stored stage differed from the expected one.
    #[error("Job {job_id} is {actual}, expected {expected}")]
    StateConflict {
        job_id: JobId,
        expected: JobStage,
        actual: JobStage,
    },

    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A remote key that would resolve outside the local cache root.
    #[error("Unsafe cache key: {0}")]
    UnsafeCacheKey(String),

    #[error(transparent)]
    Location(#[from] upscale_models::LocationError),

    #[error("Job store error: {0}")]
    JobStore(JobStoreError),

    #[error("Fleet error: {0}")]
    Fleet(#[from] upscale_fleet::FleetError),

    #[error("Media error: {0}")]
    Media(#[from] upscale_media::MediaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<JobStoreError> for WorkerError {
    fn from(e: JobStoreError) -> Self {
        match e {
            JobStoreError::StateConflict {
                job_id,
                expected,
                actual,
            } => WorkerError::StateConflict {
                job_id: JobId::from_string(job_id),
                expected,
                actual,
            },
            other => WorkerError::JobStore(other),
        }
    }
}

impl WorkerError {
    pub fn extraction_failed(msg: impl Into<String>) -> Self {
        Self::ExtractionFailed(msg.into())
    }

    pub fn encoding_failed(msg: impl Into<String>) -> Self {
        Self::EncodingFailed(msg.into())
    }

    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Check if error is retryable.
    ///
    /// A `StateConflict` is never retryable: the caller re-reads the job
    /// and decides.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Transfer(e) => e.is_retryable(),
            WorkerError::Inference(e) => e.is_retryable(),
            WorkerError::JobStore(e) => e.is_retryable(),
            WorkerError::Fleet(e) => e.is_retryable(),
            WorkerError::Media(e) => e.is_retryable(),
            WorkerError::Io(_) => true,
            _ => false,
        }
    }

    pub fn is_state_conflict(&self) -> bool {
        matches!(self, WorkerError::StateConflict { .. })
    }
}
