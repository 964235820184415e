//! Retention-based deletion of intermediate artifacts.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use upscale_jobstore::{JobStore, JobStoreError};
use upscale_models::{JobId, JobStage};
use upscale_storage::{delete_prefix, keys, ObjectStore, StorageError};

use crate::error::WorkerResult;
use crate::retry::RetryExecutor;

/// What one cleanup pass removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Objects deleted per expired job
    pub deleted: BTreeMap<String, u32>,
    /// Objects deleted per orphaned prefix
    pub orphans: BTreeMap<String, u32>,
    /// Prefixes that could not be deleted
    pub errors: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn total_deleted(&self) -> u32 {
        self.deleted.values().chain(self.orphans.values()).sum()
    }
}

/// Deletes intermediates of completed jobs past retention, plus prefixes
/// that belong to no known job.
pub struct IntermediateCleanup {
    jobs: Arc<dyn JobStore>,
    store: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
}

impl IntermediateCleanup {
    pub fn new(jobs: Arc<dyn JobStore>, store: Arc<dyn ObjectStore>, retry: RetryExecutor) -> Self {
        Self { jobs, store, retry }
    }

    pub async fn cleanup(&self, retention_days: u32) -> WorkerResult<CleanupReport> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));

        // Objects before jobs: a job record is created before its first
        // upload, so every listed object of a live job has a listed job.
        let objects = self
            .retry
            .named("list_intermediates")
            .execute_if(|| self.store.list(""), StorageError::is_retryable)
            .await?;
        let jobs = self
            .retry
            .named("list_jobs")
            .execute_if(|| self.jobs.list_jobs(), JobStoreError::is_retryable)
            .await?;

        let known: HashSet<&str> = jobs.iter().map(|job| job.job_id.as_str()).collect();
        let expired: Vec<&JobId> = jobs
            .iter()
            .filter(|job| job.stage == JobStage::Completed && job.updated_at < cutoff)
            .map(|job| &job.job_id)
            .collect();

        let orphans: BTreeSet<String> = objects
            .iter()
            .filter_map(|object| keys::job_id_from_key(&object.key))
            .filter(|job_id| !known.contains(job_id))
            .map(str::to_string)
            .collect();

        let mut report = CleanupReport::default();
        for job_id in expired {
            match self.delete(job_id.as_str()).await {
                Ok(0) => {}
                Ok(count) => {
                    report.deleted.insert(job_id.to_string(), count);
                }
                Err(e) => report.errors.push((job_id.to_string(), e.to_string())),
            }
        }
        for prefix in orphans {
            match self.delete(&prefix).await {
                Ok(count) => {
                    report.orphans.insert(prefix, count);
                }
                Err(e) => report.errors.push((prefix, e.to_string())),
            }
        }

        info!(
            jobs = report.deleted.len(),
            orphans = report.orphans.len(),
            objects = report.total_deleted(),
            errors = report.errors.len(),
            "Intermediate cleanup finished"
        );
        Ok(report)
    }

    async fn delete(&self, job_id: &str) -> WorkerResult<u32> {
        let prefix = keys::job_prefix(job_id);
        Ok(self
            .retry
            .named("delete_prefix")
            .execute_if(|| delete_prefix(self.store.as_ref(), &prefix), StorageError::is_retryable)
            .await?)
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until shutdown.
    pub async fn run(&self, retention_days: u32, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.cleanup(retention_days).await {
                        warn!(error = %e, "Intermediate cleanup failed");
                    }
                }
            }
        }
    }
}
