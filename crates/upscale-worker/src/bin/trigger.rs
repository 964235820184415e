//! Create a job for an uploaded video.
//!
//! Usage: `upscale-trigger <bucket> <key> [output-bucket]`

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use upscale_fleet::{JobRequest, QueueConfig, StreamQueue};
use upscale_jobstore::RedisJobStore;
use upscale_worker::{logging, PipelineConfig, PipelineTrigger, RetryExecutor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();
    logging::init_tracing();

    let mut args = std::env::args().skip(1);
    let (Some(bucket), Some(key)) = (args.next(), args.next()) else {
        anyhow::bail!("usage: upscale-trigger <bucket> <key> [output-bucket]");
    };
    let config = PipelineConfig::from_env();
    let output_bucket = args.next().unwrap_or(config.final_bucket);

    let jobs = Arc::new(RedisJobStore::from_env().context("job store")?);
    let uploads = StreamQueue::<JobRequest>::new(QueueConfig::uploads()).context("upload queue")?;
    uploads.init().await.context("upload queue init")?;

    let trigger = PipelineTrigger::new(jobs, Arc::new(uploads), RetryExecutor::new("trigger"))
        .with_model_type(config.model_type);

    match trigger.handle_upload(&bucket, &key, &output_bucket).await? {
        Some(job) => {
            info!(job_id = %job.job_id, "Job queued");
            println!("{}", job.job_id);
        }
        None => info!(key = %key, "Not a video, nothing to do"),
    }
    Ok(())
}
