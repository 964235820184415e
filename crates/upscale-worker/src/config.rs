//! Worker and pipeline configuration.

use std::path::PathBuf;
use std::time::Duration;

use upscale_models::ModelType;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Batch worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent batches on this instance
    pub max_concurrent_batches: usize,
    /// Work directory for temporary files
    pub work_dir: PathBuf,
    /// Root of the local artifact cache
    pub cache_dir: PathBuf,
    /// Instance ID, also used as the queue consumer name
    pub instance_id: String,
    /// Bucket holding source frames, upscaled frames and checkpoints
    pub processed_bucket: String,
    /// Log file uploaded with checkpoints
    pub log_file: Option<PathBuf>,
    /// How often the worker scans for abandoned batches
    pub claim_interval: Duration,
    /// Minimum idle time before a pending batch can be claimed (crash recovery)
    pub claim_min_idle: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Attempts per inference call
    pub inference_max_attempts: u32,
    /// Base delay for exponential backoff
    pub retry_base_delay: Duration,
    /// Backoff cap
    pub retry_max_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_batches: 2,
            work_dir: PathBuf::from("/tmp/upscale"),
            cache_dir: PathBuf::from("/tmp/upscale-cache"),
            instance_id: format!("worker-{}", uuid::Uuid::new_v4()),
            processed_bucket: "upscale-processed".to_string(),
            log_file: None,
            claim_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            inference_max_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_batches: env_parse("WORKER_MAX_BATCHES")
                .unwrap_or(defaults.max_concurrent_batches),
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            cache_dir: std::env::var("WORKER_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            instance_id: std::env::var("WORKER_INSTANCE_ID").unwrap_or(defaults.instance_id),
            processed_bucket: std::env::var("PROCESSED_BUCKET").unwrap_or(defaults.processed_bucket),
            log_file: std::env::var("WORKER_LOG_FILE").ok().map(PathBuf::from),
            claim_interval: Duration::from_secs(
                env_parse("WORKER_CLAIM_INTERVAL_SECS").unwrap_or(30),
            ),
            claim_min_idle: Duration::from_secs(
                env_parse("WORKER_CLAIM_MIN_IDLE_SECS").unwrap_or(300),
            ),
            shutdown_timeout: Duration::from_secs(
                env_parse("WORKER_SHUTDOWN_TIMEOUT").unwrap_or(30),
            ),
            inference_max_attempts: env_parse("INFERENCE_MAX_ATTEMPTS")
                .unwrap_or(defaults.inference_max_attempts)
                .max(1),
            retry_base_delay: Duration::from_millis(env_parse("RETRY_BASE_DELAY_MS").unwrap_or(200)),
            retry_max_delay: Duration::from_millis(env_parse("RETRY_MAX_DELAY_MS").unwrap_or(10_000)),
        }
    }
}

/// Pipeline controller configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Execution fleet whose capacity backs the batches
    pub fleet_id: String,
    /// Bucket for frames, checkpoints and other intermediates
    pub processed_bucket: String,
    /// Bucket for recomposed videos
    pub final_bucket: String,
    /// Work directory for extraction and encoding
    pub work_dir: PathBuf,
    /// Root of the local artifact cache
    pub cache_dir: PathBuf,
    /// How often the barrier polls batch outcomes
    pub poll_interval: Duration,
    /// Upper bound on the processing barrier
    pub barrier_timeout: Duration,
    /// Unrecoverable batch failures tolerated while other batches still run.
    ///
    /// This only delays failure: once every batch has settled, any
    /// permanently failed batch still fails the job, since its frames are
    /// missing from the encode.
    pub failed_batch_tolerance: u32,
    /// Resubmissions of a failed batch before it counts as unrecoverable
    pub batch_resubmit_limit: u32,
    /// Effective fulfillment required before an interrupted job resumes
    pub resume_fulfillment_percent: f64,
    pub model_type: ModelType,
    /// Maximum jobs driven concurrently by one controller
    pub max_concurrent_jobs: usize,
    /// Age after which completed jobs' intermediates are deleted
    pub retention_days: u32,
    /// How often the cleanup and compression passes run
    pub cleanup_interval: Duration,
    /// Gzip intermediates of completed jobs before retention deletes them
    pub compression_enabled: bool,
    /// Age after which completed jobs' intermediates are compressed
    pub compression_age_days: u32,
    /// Concurrent frame uploads/downloads during extraction and encoding
    pub transfer_concurrency: usize,
    /// Kill FFmpeg runs that take longer than this
    pub ffmpeg_timeout_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fleet_id: "upscale-spot".to_string(),
            processed_bucket: "upscale-processed".to_string(),
            final_bucket: "upscale-final".to_string(),
            work_dir: PathBuf::from("/tmp/upscale-controller"),
            cache_dir: PathBuf::from("/tmp/upscale-controller-cache"),
            poll_interval: Duration::from_secs(10),
            barrier_timeout: Duration::from_secs(6 * 3600),
            failed_batch_tolerance: 0,
            batch_resubmit_limit: 2,
            resume_fulfillment_percent: 50.0,
            model_type: ModelType::default(),
            max_concurrent_jobs: 4,
            retention_days: 7,
            cleanup_interval: Duration::from_secs(24 * 3600),
            compression_enabled: true,
            compression_age_days: 3,
            transfer_concurrency: 8,
            ffmpeg_timeout_secs: None,
        }
    }
}

impl PipelineConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            fleet_id: std::env::var("FLEET_ID").unwrap_or(defaults.fleet_id),
            processed_bucket: std::env::var("PROCESSED_BUCKET").unwrap_or(defaults.processed_bucket),
            final_bucket: std::env::var("FINAL_BUCKET").unwrap_or(defaults.final_bucket),
            work_dir: std::env::var("PIPELINE_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            cache_dir: std::env::var("PIPELINE_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            poll_interval: Duration::from_secs(
                env_parse("PIPELINE_POLL_INTERVAL_SECS").unwrap_or(10),
            ),
            barrier_timeout: Duration::from_secs(
                env_parse("PIPELINE_BARRIER_TIMEOUT_SECS").unwrap_or(6 * 3600),
            ),
            failed_batch_tolerance: env_parse("PIPELINE_FAILED_BATCH_TOLERANCE")
                .unwrap_or(defaults.failed_batch_tolerance),
            batch_resubmit_limit: env_parse("PIPELINE_BATCH_RESUBMIT_LIMIT")
                .unwrap_or(defaults.batch_resubmit_limit),
            resume_fulfillment_percent: env_parse("PIPELINE_RESUME_FULFILLMENT_PERCENT")
                .unwrap_or(defaults.resume_fulfillment_percent),
            model_type: env_parse("PIPELINE_MODEL_TYPE").unwrap_or(defaults.model_type),
            max_concurrent_jobs: env_parse("PIPELINE_MAX_JOBS").unwrap_or(defaults.max_concurrent_jobs),
            retention_days: env_parse("RETENTION_DAYS").unwrap_or(defaults.retention_days),
            cleanup_interval: Duration::from_secs(
                env_parse("CLEANUP_INTERVAL_SECS").unwrap_or(24 * 3600),
            ),
            compression_enabled: env_parse("ENABLE_COMPRESSION").unwrap_or(defaults.compression_enabled),
            compression_age_days: env_parse("COMPRESSION_AGE_DAYS").unwrap_or(defaults.compression_age_days),
            transfer_concurrency: env_parse("PIPELINE_TRANSFER_CONCURRENCY")
                .unwrap_or(defaults.transfer_concurrency)
                .max(1),
            ffmpeg_timeout_secs: env_parse("FFMPEG_TIMEOUT_SECS"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_worker_config_from_env() {
        std::env::set_var("WORKER_MAX_BATCHES", "6");
        std::env::set_var("WORKER_INSTANCE_ID", "i-0abc");
        std::env::set_var("INFERENCE_MAX_ATTEMPTS", "0");
        std::env::set_var("RETRY_BASE_DELAY_MS", "not-a-number");

        let config = WorkerConfig::from_env();
        assert_eq!(config.max_concurrent_batches, 6);
        assert_eq!(config.instance_id, "i-0abc");
        assert_eq!(config.inference_max_attempts, 1);
        assert_eq!(config.retry_base_delay, Duration::from_millis(200));

        std::env::remove_var("WORKER_MAX_BATCHES");
        std::env::remove_var("WORKER_INSTANCE_ID");
        std::env::remove_var("INFERENCE_MAX_ATTEMPTS");
        std::env::remove_var("RETRY_BASE_DELAY_MS");
    }

    #[test]
    #[serial]
    fn test_pipeline_config_defaults() {
        std::env::remove_var("PIPELINE_FAILED_BATCH_TOLERANCE");
        std::env::remove_var("RETENTION_DAYS");
        std::env::remove_var("COMPRESSION_AGE_DAYS");
        std::env::set_var("ENABLE_COMPRESSION", "false");
        std::env::set_var("PIPELINE_MODEL_TYPE", "swinir");

        let config = PipelineConfig::from_env();
        assert_eq!(config.failed_batch_tolerance, 0);
        assert_eq!(config.batch_resubmit_limit, 2);
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.resume_fulfillment_percent, 50.0);
        assert_eq!(config.model_type, ModelType::Swinir);
        assert!(!config.compression_enabled);
        assert_eq!(config.compression_age_days, 3);

        std::env::remove_var("PIPELINE_MODEL_TYPE");
        std::env::remove_var("ENABLE_COMPRESSION");
    }
}
