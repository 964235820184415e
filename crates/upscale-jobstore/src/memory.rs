//! In-memory job store for tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use upscale_models::{BatchOutcome, FallbackDecision, InterruptionRecord, Job, JobId, JobStage};

use crate::error::{JobStoreError, JobStoreResult};
use crate::store::{CounterField, JobMetadata, JobStore};

#[derive(Default)]
struct Entry {
    job: Option<Job>,
    completed_frames: BTreeSet<u32>,
    outcomes: BTreeMap<u32, BatchOutcome>,
}

/// Job store backed by a `HashMap` behind a mutex.
///
/// Every operation holds the lock for its whole duration, which gives
/// the same atomicity as the Redis scripts.
#[derive(Default)]
pub struct MemoryJobStore {
    entries: Mutex<HashMap<JobId, Entry>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct frames recorded as processed.
    pub fn completed_frame_count(&self, job_id: &JobId) -> usize {
        self.lock()
            .get(job_id)
            .map(|e| e.completed_frames.len())
            .unwrap_or(0)
    }

    /// Overwrite the stored stage without any checks.
    pub fn force_stage(&self, job_id: &JobId, stage: JobStage) {
        if let Some(job) = self.lock().get_mut(job_id).and_then(|e| e.job.as_mut()) {
            job.stage = stage;
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_job<T>(
        &self,
        job_id: &JobId,
        f: impl FnOnce(&mut Job, &mut Entry) -> JobStoreResult<T>,
    ) -> JobStoreResult<T> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(job_id)
            .ok_or_else(|| JobStoreError::not_found(job_id.as_str()))?;
        let mut job = entry
            .job
            .take()
            .ok_or_else(|| JobStoreError::not_found(job_id.as_str()))?;
        let result = f(&mut job, entry);
        entry.job = Some(job);
        result
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: &Job) -> JobStoreResult<()> {
        let mut entries = self.lock();
        if entries.contains_key(&job.job_id) {
            return Err(JobStoreError::AlreadyExists(job.job_id.to_string()));
        }
        entries.insert(
            job.job_id.clone(),
            Entry {
                job: Some(job.clone()),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> JobStoreResult<Job> {
        self.lock()
            .get(job_id)
            .and_then(|e| e.job.clone())
            .ok_or_else(|| JobStoreError::not_found(job_id.as_str()))
    }

    async fn conditional_update_stage(
        &self,
        job_id: &JobId,
        expected: JobStage,
        new: JobStage,
    ) -> JobStoreResult<Job> {
        expected.transition(new)?;
        self.with_job(job_id, |job, _| {
            if job.stage != expected {
                return Err(JobStoreError::StateConflict {
                    job_id: job_id.to_string(),
                    expected,
                    actual: job.stage,
                });
            }
            job.stage = new;
            job.updated_at = Utc::now();
            Ok(job.clone())
        })
    }

    async fn atomic_increment(
        &self,
        job_id: &JobId,
        field: CounterField,
        delta: u32,
    ) -> JobStoreResult<u32> {
        self.with_job(job_id, |job, _| {
            let counter = match field {
                CounterField::FramesExtracted => &mut job.frames_extracted,
                CounterField::FramesProcessed => &mut job.frames_processed,
            };
            let mut value = counter.saturating_add(delta);
            if job.frame_count > 0 {
                value = value.min(job.frame_count);
            }
            *counter = value;
            job.updated_at = Utc::now();
            Ok(value)
        })
    }

    async fn record_frames_processed(&self, job_id: &JobId, frames: &[u32]) -> JobStoreResult<u32> {
        self.with_job(job_id, |job, entry| {
            let added = frames
                .iter()
                .filter(|f| entry.completed_frames.insert(**f))
                .count() as u32;
            if added > 0 {
                job.frames_processed += added;
                job.updated_at = Utc::now();
            }
            Ok(added)
        })
    }

    async fn update_metadata(&self, job_id: &JobId, metadata: &JobMetadata) -> JobStoreResult<()> {
        self.with_job(job_id, |job, _| {
            metadata.apply_to(job);
            job.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn record_batch_outcome(&self, outcome: &BatchOutcome) -> JobStoreResult<()> {
        self.with_job(&outcome.job_id, |_, entry| {
            entry.outcomes.insert(outcome.index, outcome.clone());
            Ok(())
        })
    }

    async fn batch_outcomes(&self, job_id: &JobId) -> JobStoreResult<Vec<BatchOutcome>> {
        self.with_job(job_id, |_, entry| Ok(entry.outcomes.values().cloned().collect()))
    }

    async fn clear_batch_outcome(&self, job_id: &JobId, index: u32) -> JobStoreResult<()> {
        self.with_job(job_id, |_, entry| {
            entry.outcomes.remove(&index);
            Ok(())
        })
    }

    async fn record_interruption(
        &self,
        job_id: &JobId,
        interruption: &InterruptionRecord,
    ) -> JobStoreResult<()> {
        self.with_job(job_id, |job, _| {
            job.interruption = Some(interruption.clone());
            job.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn record_fallback(
        &self,
        job_id: &JobId,
        decision: &FallbackDecision,
    ) -> JobStoreResult<()> {
        self.with_job(job_id, |job, _| {
            job.fallback = Some(decision.clone());
            job.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn set_error(&self, job_id: &JobId, message: &str) -> JobStoreResult<()> {
        self.with_job(job_id, |job, _| {
            job.error_message = Some(message.to_string());
            job.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn list_jobs(&self) -> JobStoreResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self.lock().values().filter_map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }
}
