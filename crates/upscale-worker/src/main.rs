//! Batch worker binary: one per fleet instance.

use std::sync::Arc;

use tracing::{error, info};

use upscale_fleet::{QueueConfig, RedisAgentChannel, RedisFleet, StreamQueue};
use upscale_inference::InferenceClient;
use upscale_jobstore::RedisJobStore;
use upscale_models::Batch;
use upscale_storage::{BucketResolver, S3Client};
use upscale_worker::{
    logging, metrics, BatchExecutor, FrameWorker, RetryExecutor, RunningBatches, WorkerAgent, WorkerConfig,
};

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Load environment variables
    dotenvy::dotenv().ok();

    logging::init_tracing();
    info!("Starting upscale-worker");

    if let Err(e) = metrics::install_exporter() {
        error!("Failed to install metrics exporter: {}", e);
    }

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    let storage = match S3Client::from_env().await {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create storage client: {}", e);
            std::process::exit(1);
        }
    };
    let store = storage.store_for(&config.processed_bucket);

    let jobs = match RedisJobStore::from_env() {
        Ok(j) => Arc::new(j),
        Err(e) => {
            error!("Failed to create job store: {}", e);
            std::process::exit(1);
        }
    };

    let batches = match StreamQueue::<Batch>::new(QueueConfig::batches()) {
        Ok(q) => Arc::new(q),
        Err(e) => {
            error!("Failed to create batch queue: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = batches.init().await {
        error!("Failed to initialize batch queue: {}", e);
        std::process::exit(1);
    }

    let fleet = match RedisFleet::from_env() {
        Ok(f) => Arc::new(f),
        Err(e) => {
            error!("Failed to create fleet client: {}", e);
            std::process::exit(1);
        }
    };

    let agents = match RedisAgentChannel::from_env() {
        Ok(a) => Arc::new(a),
        Err(e) => {
            error!("Failed to create agent channel: {}", e);
            std::process::exit(1);
        }
    };

    let inference = match InferenceClient::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to create inference client: {}", e);
            std::process::exit(1);
        }
    };

    let retry = RetryExecutor::new("worker")
        .with_base_delay(config.retry_base_delay)
        .with_max_delay(config.retry_max_delay);

    let worker = FrameWorker::new(
        Arc::clone(&store),
        inference,
        jobs.clone(),
        &config.cache_dir,
        &config.work_dir,
        retry.clone(),
    )
    .with_inference_attempts(config.inference_max_attempts);

    let running = Arc::new(RunningBatches::new());
    let agent = Arc::new(
        WorkerAgent::new(
            config.instance_id.clone(),
            Arc::clone(&running),
            store,
            jobs.clone(),
            retry,
        )
        .with_log_file(config.log_file.clone()),
    );

    let executor = Arc::new(BatchExecutor::new(
        config,
        batches,
        fleet,
        jobs,
        Arc::new(worker),
        running,
    ));

    let agent_handle = tokio::spawn(agent.run(agents, executor.shutdown_signal()));

    // Setup signal handlers
    let shutdown_executor = Arc::clone(&executor);
    let shutdown_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        shutdown_executor.shutdown();
    });

    if let Err(e) = executor.run().await {
        error!("Executor error: {}", e);
        std::process::exit(1);
    }

    shutdown_handle.abort();
    match agent_handle.await {
        Ok(Err(e)) => error!("Agent error: {}", e),
        Err(e) => error!("Agent task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Worker shutdown complete");
}
