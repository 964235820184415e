//! Per-instance worker agent.
//!
//! Answers controller commands for this instance. A checkpoint command
//! stops the matching batches after their in-flight frame, writes a
//! checkpoint of the uploaded frames, records the batches as interrupted
//! and uploads the instance log.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use upscale_fleet::AgentInbox;
use upscale_jobstore::{JobStore, JobStoreError};
use upscale_models::{AgentCommand, AgentReport, BatchOutcome, BatchStatus, Checkpoint, CheckpointId, JobId};
use upscale_storage::{keys, CheckpointStore, ObjectStore, StorageError};

use crate::error::WorkerResult;
use crate::frame_worker::FrameWorker;
use crate::retry::RetryExecutor;
use crate::running::RunningBatches;

const LOG_CONTENT_TYPE: &str = "text/plain";

pub struct WorkerAgent {
    instance_id: String,
    running: Arc<RunningBatches>,
    store: Arc<dyn ObjectStore>,
    checkpoints: CheckpointStore,
    jobs: Arc<dyn JobStore>,
    log_file: Option<PathBuf>,
    retry: RetryExecutor,
}

impl WorkerAgent {
    pub fn new(
        instance_id: impl Into<String>,
        running: Arc<RunningBatches>,
        store: Arc<dyn ObjectStore>,
        jobs: Arc<dyn JobStore>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            running,
            checkpoints: CheckpointStore::new(Arc::clone(&store)),
            store,
            jobs,
            log_file: None,
            retry,
        }
    }

    pub fn with_log_file(mut self, log_file: Option<PathBuf>) -> Self {
        self.log_file = log_file;
        self
    }

    /// Serve commands until shutdown.
    pub async fn run(self: Arc<Self>, inbox: Arc<dyn AgentInbox>, mut shutdown: watch::Receiver<bool>) -> WorkerResult<()> {
        let mut commands = inbox.commands(&self.instance_id).await?;
        info!(instance_id = %self.instance_id, "Worker agent listening");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                command = commands.next() => {
                    let Some(command) = command else {
                        warn!(instance_id = %self.instance_id, "Command stream closed");
                        break;
                    };
                    let agent = Arc::clone(&self);
                    let inbox = Arc::clone(&inbox);
                    tokio::spawn(async move {
                        let report = agent.handle(command).await;
                        if let Err(e) = inbox.reply(&report).await {
                            error!(request_id = %report.request_id, error = %e, "Failed to send agent reply");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Execute one command. Failures are reported in the reply.
    pub async fn handle(&self, command: AgentCommand) -> AgentReport {
        match command {
            AgentCommand::Ping { request_id } => AgentReport::new(request_id, &self.instance_id),
            AgentCommand::Checkpoint {
                request_id,
                job_id,
                batch_index,
                deadline,
            } => match self.checkpoint(&request_id, &job_id, batch_index, deadline).await {
                Ok(report) => report,
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Checkpoint failed");
                    let mut report = AgentReport::new(request_id, &self.instance_id);
                    report.error = Some(e.to_string());
                    report
                }
            },
        }
    }

    async fn checkpoint(
        &self,
        request_id: &str,
        job_id: &JobId,
        batch_index: Option<u32>,
        deadline: DateTime<Utc>,
    ) -> WorkerResult<AgentReport> {
        let handles = self.running.for_job(job_id, batch_index);
        info!(
            job_id = %job_id,
            batches = handles.len(),
            deadline = %deadline,
            "Checkpoint requested"
        );
        // Outcomes first: whatever the checkpoint below fails to cover is
        // redone by the resubmitted batch.
        for handle in &handles {
            let batch = handle.batch();
            let outcome = BatchOutcome::new(batch, BatchStatus::Interrupted, handle.completed_frames().len() as u32)
                .with_instance(&self.instance_id);
            match self
                .retry
                .named("record_batch_outcome")
                .execute_if(|| self.jobs.record_batch_outcome(&outcome), JobStoreError::is_retryable)
                .await
            {
                Ok(()) => handle.stop_for_checkpoint(),
                Err(e) => {
                    // Left unacked so the queue redelivers it
                    warn!(job_id = %job_id, batch = batch.index, error = %e, "Cannot record interruption");
                    handle.stop();
                }
            }
        }

        let mut uploads_flushed = true;
        for handle in &handles {
            if !handle.wait_finished(until(deadline)).await {
                warn!(job_id = %job_id, batch = handle.batch().index, "Batch still running at deadline");
                uploads_flushed = false;
            }
        }

        let prefix = keys::upscaled_prefix(job_id.as_str());
        let mut manifest: Vec<String> = self
            .retry
            .named("list_upscaled")
            .execute_if(|| self.store.list(&prefix), StorageError::is_retryable)
            .await?
            .into_iter()
            .map(|object| object.key)
            .collect();
        for handle in &handles {
            manifest.extend(FrameWorker::completed_keys(handle.batch(), handle));
        }

        let checkpoint = Checkpoint::new(job_id.clone(), &self.instance_id, batch_index, manifest);
        let key = self
            .retry
            .named("write_checkpoint")
            .execute_if(|| self.checkpoints.write(&checkpoint), StorageError::is_retryable)
            .await?;
        info!(job_id = %job_id, key = %key, frames = checkpoint.manifest.len(), "Checkpoint stored");

        let logs_uploaded = self.upload_log(job_id, &checkpoint.checkpoint_id).await;

        let mut report = AgentReport::new(request_id, &self.instance_id);
        report.frames_checkpointed = checkpoint.manifest.len() as u32;
        report.checkpoint_id = Some(checkpoint.checkpoint_id);
        report.uploads_flushed = uploads_flushed;
        report.logs_uploaded = logs_uploaded;
        Ok(report)
    }

    async fn upload_log(&self, job_id: &JobId, checkpoint_id: &CheckpointId) -> bool {
        let Some(path) = &self.log_file else {
            return false;
        };
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read log file");
                return false;
            }
        };

        let key = keys::log_key(job_id.as_str(), &self.instance_id, checkpoint_id.as_str());
        match self
            .retry
            .named("upload_log")
            .execute_if(
                || self.store.put(&key, bytes.clone(), LOG_CONTENT_TYPE),
                StorageError::is_retryable,
            )
            .await
        {
            Ok(_) => {
                debug!(key = %key, "Uploaded log");
                true
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Log upload failed");
                false
            }
        }
    }
}

/// Time left until `deadline`, zero once it passed.
fn until(deadline: DateTime<Utc>) -> Duration {
    (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use upscale_fleet::{AgentChannel, MemoryAgentChannel};
    use upscale_jobstore::MemoryJobStore;
    use upscale_models::{Batch, Job, ModelType};
    use upscale_storage::MemoryObjectStore;

    struct Setup {
        _dir: tempfile::TempDir,
        agent: WorkerAgent,
        running: Arc<RunningBatches>,
        store: Arc<MemoryObjectStore>,
        jobs: Arc<MemoryJobStore>,
        batch: Batch,
    }

    async fn setup() -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let log_file = dir.path().join("worker.log");
        tokio::fs::write(&log_file, b"INFO batch started\n").await.unwrap();

        let running = Arc::new(RunningBatches::new());
        let store = Arc::new(MemoryObjectStore::new());
        let jobs = Arc::new(MemoryJobStore::new());

        let job = Job::with_id(
            JobId::from_string("job"),
            "a.mp4",
            "s3://in/a.mp4",
            "s3://out/a.mp4",
            ModelType::default(),
        );
        jobs.create_job(&job).await.unwrap();

        let retry = RetryExecutor::new("test").with_base_delay(Duration::from_millis(1));
        let agent = WorkerAgent::new("i-1", running.clone(), store.clone(), jobs.clone(), retry)
            .with_log_file(Some(log_file));

        let batch = Batch {
            job_id: job.job_id,
            index: 1,
            start_frame: 6,
            end_frame: 10,
            vcpus: 2,
            memory_mb: 2048,
            model_type: ModelType::default(),
        };

        Setup {
            _dir: dir,
            agent,
            running,
            store,
            jobs,
            batch,
        }
    }

    #[tokio::test]
    async fn test_checkpoint_stops_batch_and_records_progress() {
        let s = setup().await;
        s.store.insert(keys::upscaled_frame_key("job", 1), b"x".to_vec());
        s.store.insert(keys::upscaled_frame_key("job", 6), b"x".to_vec());

        let handle = s.running.register(&s.batch);
        handle.mark_completed(6);
        handle.mark_completed(7);

        // the "worker": finish as soon as it is stopped
        let worker = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                let mut stop = handle.stop_signal();
                stop.wait_for(|stopped| *stopped).await.unwrap();
                handle.finish();
            })
        };

        let command = AgentCommand::checkpoint(
            s.batch.job_id.clone(),
            Some(1),
            Utc::now() + chrono::Duration::seconds(5),
        );
        let report = s.agent.handle(command).await;
        worker.await.unwrap();

        assert!(report.error.is_none(), "{:?}", report.error);
        assert!(report.uploads_flushed);
        assert!(report.logs_uploaded);
        assert_eq!(report.frames_checkpointed, 3);
        assert!(handle.is_checkpointing());

        let checkpoint = CheckpointStore::new(s.store.clone())
            .latest(&s.batch.job_id)
            .await
            .unwrap()
            .unwrap();
        assert!(checkpoint.contains(&keys::upscaled_frame_key("job", 7)));
        assert_eq!(Some(checkpoint.checkpoint_id.clone()), report.checkpoint_id);

        let outcomes = s.jobs.batch_outcomes(&s.batch.job_id).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, BatchStatus::Interrupted);
        assert_eq!(outcomes[0].frames_done, 2);
        assert_eq!(outcomes[0].instance_id.as_deref(), Some("i-1"));

        let log_key = keys::log_key("job", "i-1", checkpoint.checkpoint_id.as_str());
        assert_eq!(s.store.bytes(&log_key).unwrap(), b"INFO batch started\n");
    }

    /// Store whose listings fail, as during a storage outage.
    struct ListOutage(Arc<MemoryObjectStore>);

    #[async_trait::async_trait]
    impl ObjectStore for ListOutage {
        async fn get(&self, key: &str) -> upscale_storage::StorageResult<upscale_storage::StoredObject> {
            self.0.get(key).await
        }

        async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> upscale_storage::StorageResult<String> {
            self.0.put(key, bytes, content_type).await
        }

        async fn put_if_absent(
            &self,
            key: &str,
            bytes: Vec<u8>,
            content_type: &str,
        ) -> upscale_storage::StorageResult<bool> {
            self.0.put_if_absent(key, bytes, content_type).await
        }

        async fn head(&self, key: &str) -> upscale_storage::StorageResult<String> {
            self.0.head(key).await
        }

        async fn list(&self, _prefix: &str) -> upscale_storage::StorageResult<Vec<upscale_storage::ObjectInfo>> {
            Err(StorageError::not_found("listing"))
        }

        async fn delete_many(&self, keys: &[String]) -> upscale_storage::StorageResult<u32> {
            self.0.delete_many(keys).await
        }
    }

    #[tokio::test]
    async fn test_failed_checkpoint_still_records_interruption() {
        let s = setup().await;
        let retry = RetryExecutor::new("test").with_base_delay(Duration::from_millis(1));
        let agent = WorkerAgent::new(
            "i-1",
            s.running.clone(),
            Arc::new(ListOutage(s.store.clone())),
            s.jobs.clone(),
            retry,
        );

        let handle = s.running.register(&s.batch);
        handle.mark_completed(6);
        handle.finish();

        let command = AgentCommand::checkpoint(
            s.batch.job_id.clone(),
            Some(1),
            Utc::now() + chrono::Duration::seconds(5),
        );
        let report = agent.handle(command).await;

        assert!(report.error.is_some());
        assert!(report.checkpoint_id.is_none());
        assert!(handle.is_checkpointing());

        // the barrier sees the batch as interrupted and resubmits it
        let outcomes = s.jobs.batch_outcomes(&s.batch.job_id).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].index, 1);
        assert_eq!(outcomes[0].status, BatchStatus::Interrupted);
        assert_eq!(outcomes[0].frames_done, 1);
    }

    #[tokio::test]
    async fn test_batch_missing_deadline_is_reported() {
        let s = setup().await;
        s.running.register(&s.batch);

        let command = AgentCommand::checkpoint(
            s.batch.job_id.clone(),
            None,
            Utc::now() + chrono::Duration::milliseconds(20),
        );
        let report = s.agent.handle(command).await;

        assert!(report.error.is_none());
        assert!(!report.uploads_flushed);
        assert!(report.checkpoint_id.is_some());
    }

    #[tokio::test]
    async fn test_agent_answers_over_channel() {
        let s = setup().await;
        let channel = Arc::new(MemoryAgentChannel::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let agent = Arc::new(s.agent);
        let task = tokio::spawn(Arc::clone(&agent).run(channel.clone(), shutdown_rx));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = channel
            .send("i-1", AgentCommand::ping(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.instance_id, "i-1");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
