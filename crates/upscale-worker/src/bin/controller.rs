//! Pipeline controller binary.
//!
//! Drives queued jobs through the pipeline, reacts to interruption notices
//! and periodically compresses aging intermediates and deletes expired ones.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

use upscale_fleet::{JobRequest, QueueConfig, RedisAgentChannel, RedisFleet, RedisInterruptions, StreamQueue};
use upscale_jobstore::{JobStore, RedisJobStore};
use upscale_models::JobId;
use upscale_media::FfmpegCodec;
use upscale_storage::{BucketResolver, S3Client};
use upscale_worker::{
    logging, metrics, IntermediateCleanup, IntermediateCompression, PipelineConfig, PipelineDriver,
    PreemptionController, RetryExecutor,
};

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    dotenvy::dotenv().ok();

    logging::init_tracing();
    info!("Starting upscale-controller");

    if let Err(e) = metrics::install_exporter() {
        error!("Failed to install metrics exporter: {}", e);
    }

    let config = PipelineConfig::from_env();
    info!("Pipeline config: {:?}", config);
    let consumer = std::env::var("CONTROLLER_ID").unwrap_or_else(|_| format!("controller-{}", uuid::Uuid::new_v4()));

    let storage = match S3Client::from_env().await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Failed to create storage client: {}", e);
            std::process::exit(1);
        }
    };

    let jobs = match RedisJobStore::from_env() {
        Ok(j) => Arc::new(j),
        Err(e) => {
            error!("Failed to create job store: {}", e);
            std::process::exit(1);
        }
    };

    let fleet = match RedisFleet::from_env() {
        Ok(f) => Arc::new(f),
        Err(e) => {
            error!("Failed to create fleet client: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = fleet.init().await {
        error!("Failed to initialize batch queue: {}", e);
        std::process::exit(1);
    }

    let uploads = match StreamQueue::<JobRequest>::new(QueueConfig::uploads()) {
        Ok(q) => Arc::new(q),
        Err(e) => {
            error!("Failed to create upload queue: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = uploads.init().await {
        error!("Failed to initialize upload queue: {}", e);
        std::process::exit(1);
    }

    let (agents, interruptions) = match (RedisAgentChannel::from_env(), RedisInterruptions::from_env()) {
        (Ok(a), Ok(i)) => (Arc::new(a), Arc::new(i)),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to create fleet channels: {}", e);
            std::process::exit(1);
        }
    };

    let retry = RetryExecutor::new("controller");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let preemption = Arc::new(PreemptionController::new(
        jobs.clone(),
        fleet.clone(),
        agents,
        config.fleet_id.clone(),
        retry.clone(),
    ));
    let preemption_handle = tokio::spawn(preemption.run(interruptions, shutdown_rx.clone()));

    let cleanup = IntermediateCleanup::new(jobs.clone(), storage.store_for(&config.processed_bucket), retry.clone());
    let retention_days = config.retention_days;
    let cleanup_interval = config.cleanup_interval;
    let cleanup_shutdown = shutdown_rx.clone();
    let cleanup_handle = tokio::spawn(async move {
        cleanup.run(retention_days, cleanup_interval, cleanup_shutdown).await;
    });

    let compression_handle = config.compression_enabled.then(|| {
        let compression =
            IntermediateCompression::new(jobs.clone(), storage.store_for(&config.processed_bucket), retry.clone());
        let age_days = config.compression_age_days;
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            compression.run(age_days, cleanup_interval, shutdown).await;
        })
    });

    let max_jobs = config.max_concurrent_jobs;
    let codec = match config.ffmpeg_timeout_secs {
        Some(secs) => FfmpegCodec::new().with_timeout(secs),
        None => FfmpegCodec::new(),
    };
    let driver = Arc::new(PipelineDriver::new(
        config,
        jobs.clone(),
        storage,
        fleet,
        Arc::new(codec),
        retry,
    ));

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let semaphore = Arc::new(Semaphore::new(max_jobs));

    // Jobs left mid-pipeline by a previous controller run
    match resumable_jobs(jobs.as_ref()).await {
        Ok(ids) => {
            if !ids.is_empty() {
                info!(count = ids.len(), "Resuming unfinished jobs");
            }
            for job_id in ids {
                spawn_job(&semaphore, &driver, job_id).await;
            }
        }
        Err(e) => warn!("Failed to list unfinished jobs: {}", e),
    }

    let mut shutdown = shutdown_rx;
    loop {
        let deliveries = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            result = uploads.consume(&consumer, Duration::from_secs(1), semaphore.available_permits().max(1)) => result,
        };

        let deliveries = match deliveries {
            Ok(d) => d,
            Err(e) => {
                error!("Error consuming job requests: {}", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        for delivery in deliveries {
            // The job record is the source of truth from here on; a crash
            // is recovered by the resume scan above.
            if let Err(e) = uploads.ack(&delivery.message_id).await {
                error!(message_id = %delivery.message_id, error = %e, "Failed to ack job request");
            }
            spawn_job(&semaphore, &driver, delivery.payload.job_id).await;
        }
    }

    info!("Waiting for running jobs...");
    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        while semaphore.available_permits() < max_jobs {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;

    let _ = cleanup_handle.await;
    if let Some(handle) = compression_handle {
        let _ = handle.await;
    }
    match preemption_handle.await {
        Ok(Err(e)) => error!("Preemption controller error: {}", e),
        Err(e) => error!("Preemption controller task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Controller shutdown complete");
}

/// Non-terminal jobs, oldest first.
async fn resumable_jobs(jobs: &dyn JobStore) -> anyhow::Result<Vec<JobId>> {
    let mut pending: Vec<_> = jobs
        .list_jobs()
        .await?
        .into_iter()
        .filter(|job| !job.is_terminal())
        .collect();
    pending.sort_by_key(|job| job.created_at);
    Ok(pending.into_iter().map(|job| job.job_id).collect())
}

async fn spawn_job(semaphore: &Arc<Semaphore>, driver: &Arc<PipelineDriver>, job_id: JobId) {
    let Ok(permit) = Arc::clone(semaphore).acquire_owned().await else {
        return;
    };
    let driver = Arc::clone(driver);
    tokio::spawn(async move {
        let _permit = permit;
        match driver.run(&job_id).await {
            Ok(job) => info!(job_id = %job_id, stage = %job.stage, "Job settled"),
            Err(e) => error!(job_id = %job_id, error = %e, "Job failed"),
        }
    });
}
