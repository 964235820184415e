//! Batch executor.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use upscale_fleet::{BatchSource, Delivery, ExecutionFleet};
use upscale_jobstore::{JobStore, JobStoreError};
use upscale_models::{Batch, BatchOutcome, BatchStatus, InstanceAssignment};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::frame_worker::FrameWorker;
use crate::metrics;
use crate::retry::RetryExecutor;
use crate::running::RunningBatches;

/// Runs batches from the fleet queue on this instance.
pub struct BatchExecutor {
    config: WorkerConfig,
    source: Arc<dyn BatchSource>,
    fleet: Arc<dyn ExecutionFleet>,
    jobs: Arc<dyn JobStore>,
    worker: Arc<FrameWorker>,
    running: Arc<RunningBatches>,
    retry: RetryExecutor,
    batch_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

/// Everything a spawned batch execution needs.
#[derive(Clone)]
struct ExecutionContext {
    instance_id: String,
    source: Arc<dyn BatchSource>,
    fleet: Arc<dyn ExecutionFleet>,
    jobs: Arc<dyn JobStore>,
    worker: Arc<FrameWorker>,
    running: Arc<RunningBatches>,
    retry: RetryExecutor,
}

impl BatchExecutor {
    pub fn new(
        config: WorkerConfig,
        source: Arc<dyn BatchSource>,
        fleet: Arc<dyn ExecutionFleet>,
        jobs: Arc<dyn JobStore>,
        worker: Arc<FrameWorker>,
        running: Arc<RunningBatches>,
    ) -> Self {
        let batch_semaphore = Arc::new(Semaphore::new(config.max_concurrent_batches));
        let (shutdown, _) = watch::channel(false);
        let retry = RetryExecutor::new("executor")
            .with_base_delay(config.retry_base_delay)
            .with_max_delay(config.retry_max_delay);

        Self {
            config,
            source,
            fleet,
            jobs,
            worker,
            running,
            retry,
            batch_semaphore,
            shutdown,
        }
    }

    fn context(&self) -> ExecutionContext {
        ExecutionContext {
            instance_id: self.config.instance_id.clone(),
            source: Arc::clone(&self.source),
            fleet: Arc::clone(&self.fleet),
            jobs: Arc::clone(&self.jobs),
            worker: Arc::clone(&self.worker),
            running: Arc::clone(&self.running),
            retry: self.retry.clone(),
        }
    }

    /// Consume batches until [`shutdown`](Self::shutdown) is signalled.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            instance_id = %self.config.instance_id,
            max_batches = self.config.max_concurrent_batches,
            "Starting batch executor"
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        // Batches left pending by crashed workers
        let claim_ctx = self.context();
        let claim_semaphore = Arc::clone(&self.batch_semaphore);
        let claim_interval = self.config.claim_interval;
        let claim_min_idle = self.config.claim_min_idle;
        let mut shutdown_rx_claim = self.shutdown.subscribe();

        let claim_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(claim_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx_claim.changed() => {
                        if *shutdown_rx_claim.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let available = claim_semaphore.available_permits();
                        if available == 0 {
                            continue;
                        }
                        match claim_ctx.source.claim_stale(&claim_ctx.instance_id, claim_min_idle, available).await {
                            Ok(deliveries) if !deliveries.is_empty() => {
                                info!(count = deliveries.len(), "Claimed stale batches");
                                for delivery in deliveries {
                                    let Ok(permit) = Arc::clone(&claim_semaphore).acquire_owned().await else {
                                        break;
                                    };
                                    let ctx = claim_ctx.clone();
                                    tokio::spawn(async move {
                                        let _permit = permit;
                                        ctx.execute(delivery).await;
                                    });
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Failed to claim stale batches"),
                        }
                    }
                }
            }
        });

        let ctx = self.context();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping executor");
                        break;
                    }
                }
                result = self.consume(&ctx) => {
                    if let Err(e) = result {
                        error!(error = %e, "Error consuming batches");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        claim_task.abort();

        // Running batches stop after their in-flight frame; their messages stay
        // pending and are claimed again by another worker.
        for handle in self.running.all() {
            handle.stop();
        }
        info!("Waiting for in-flight batches to stop...");
        let _ = tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_batches()).await;

        info!("Batch executor stopped");
        Ok(())
    }

    async fn consume(&self, ctx: &ExecutionContext) -> WorkerResult<()> {
        let available = self.batch_semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let deliveries = self
            .source
            .receive(&self.config.instance_id, Duration::from_secs(1), available)
            .await?;
        if deliveries.is_empty() {
            return Ok(());
        }
        debug!(count = deliveries.len(), "Received batches");

        for delivery in deliveries {
            let ctx = ctx.clone();
            let permit = Arc::clone(&self.batch_semaphore)
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::job_failed("Semaphore closed"))?;

            tokio::spawn(async move {
                let _permit = permit;
                ctx.execute(delivery).await;
            });
        }
        Ok(())
    }

    async fn wait_for_batches(&self) {
        while self.batch_semaphore.available_permits() < self.config.max_concurrent_batches {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Receiver that flips to `true` on shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

impl ExecutionContext {
    /// Run one delivery and settle its message.
    async fn execute(&self, delivery: Delivery<Batch>) {
        let batch = &delivery.payload;

        let deliveries = self.source.record_delivery(&delivery.message_id).await.unwrap_or(1);
        if deliveries > self.source.max_deliveries() {
            warn!(
                job_id = %batch.job_id,
                batch = batch.index,
                deliveries,
                "Batch exceeded max deliveries, moving to DLQ"
            );
            let reason = format!("delivered {} times without completing", deliveries - 1);
            if let Err(e) = self.source.dead_letter(&delivery, &reason).await {
                error!(job_id = %batch.job_id, error = %e, "Failed to dead-letter batch");
            }
            let outcome = BatchOutcome::new(batch, BatchStatus::Failed, 0)
                .with_error(reason)
                .with_instance(&self.instance_id);
            self.record_outcome(&outcome).await;
            metrics::record_batch(BatchStatus::Failed);
            return;
        }

        match self.jobs.get_job(&batch.job_id).await {
            Ok(job) if job.is_terminal() => {
                info!(job_id = %batch.job_id, stage = %job.stage, "Job finished, dropping batch");
                self.ack(&delivery).await;
                return;
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                warn!(job_id = %batch.job_id, "Job no longer exists, dropping batch");
                self.ack(&delivery).await;
                return;
            }
            Err(e) => {
                // Left pending; claimed again after the idle timeout
                warn!(job_id = %batch.job_id, error = %e, "Cannot read job, leaving batch pending");
                return;
            }
        }

        let assignment = InstanceAssignment {
            instance_id: self.instance_id.clone(),
            job_id: batch.job_id.clone(),
            batch_index: batch.index,
            execution_id: Uuid::new_v4().to_string(),
            assigned_at: Utc::now(),
        };
        if let Err(e) = self.fleet.assign_instance(&assignment).await {
            warn!(job_id = %batch.job_id, error = %e, "Failed to record instance assignment");
        }

        let handle = self.running.register(batch);
        info!(
            job_id = %batch.job_id,
            batch = batch.index,
            execution_id = %assignment.execution_id,
            "Executing batch"
        );

        let outcome = match self.worker.process(batch, &handle).await {
            Ok(result) => BatchOutcome::from_result(batch, &result),
            Err(e) => {
                error!(job_id = %batch.job_id, batch = batch.index, error = %e, "Batch failed");
                BatchOutcome::new(batch, BatchStatus::Failed, handle.completed_frames().len() as u32)
                    .with_error(e.to_string())
            }
        }
        .with_instance(&self.instance_id);

        let stopped_for_shutdown = handle.is_stopped() && !handle.is_checkpointing();
        if handle.is_checkpointing() {
            debug!(job_id = %batch.job_id, batch = batch.index, "Outcome recorded by the checkpoint");
        } else if !stopped_for_shutdown {
            self.record_outcome(&outcome).await;
        }
        metrics::record_batch(outcome.status);

        if !stopped_for_shutdown {
            self.ack(&delivery).await;
        }
        if let Err(e) = self
            .fleet
            .release_instance(&self.instance_id, &batch.job_id, batch.index)
            .await
        {
            warn!(job_id = %batch.job_id, batch = batch.index, error = %e, "Failed to release instance assignment");
        }
        self.running.remove(batch);
        handle.finish();
    }

    async fn record_outcome(&self, outcome: &BatchOutcome) {
        let result = self
            .retry
            .named("record_batch_outcome")
            .execute_if(|| self.jobs.record_batch_outcome(outcome), JobStoreError::is_retryable)
            .await;
        if let Err(e) = result {
            error!(job_id = %outcome.job_id, batch = outcome.index, error = %e, "Failed to record batch outcome");
        }
    }

    async fn ack(&self, delivery: &Delivery<Batch>) {
        if let Err(e) = self.source.ack(&delivery.message_id).await {
            error!(message_id = %delivery.message_id, error = %e, "Failed to ack batch");
        }
    }
}
