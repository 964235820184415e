//! Registry of batches executing on this instance.
//!
//! Shared by the batch executor, which runs batches, and the agent, which
//! stops them and checkpoints their progress.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;

use upscale_models::{Batch, JobId};

/// Control handle of one running batch execution.
pub struct BatchHandle {
    batch: Batch,
    stop_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    completed: Mutex<BTreeSet<u32>>,
    checkpointing: AtomicBool,
}

impl BatchHandle {
    pub fn new(batch: Batch) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);
        Arc::new(Self {
            batch,
            stop_tx,
            done_tx,
            completed: Mutex::new(BTreeSet::new()),
            checkpointing: AtomicBool::new(false),
        })
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    /// Ask the worker to stop after the in-flight frame.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Stop on behalf of a checkpoint. The checkpointing side has already
    /// recorded the batch outcome, so the executor only acks the message.
    pub fn stop_for_checkpoint(&self) {
        self.checkpointing.store(true, Ordering::SeqCst);
        self.stop();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    pub fn is_checkpointing(&self) -> bool {
        self.checkpointing.load(Ordering::SeqCst)
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn mark_completed(&self, frame: u32) {
        self.lock_completed().insert(frame);
    }

    pub fn is_completed(&self, frame: u32) -> bool {
        self.lock_completed().contains(&frame)
    }

    /// Frames finished by this execution, ascending.
    pub fn completed_frames(&self) -> Vec<u32> {
        self.lock_completed().iter().copied().collect()
    }

    /// Signal that the execution returned.
    pub fn finish(&self) {
        self.done_tx.send_replace(true);
    }

    /// Wait up to `timeout` for the execution to return.
    pub async fn wait_finished(&self, timeout: Duration) -> bool {
        let mut done_rx = self.done_tx.subscribe();
        tokio::time::timeout(timeout, done_rx.wait_for(|done| *done))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    fn lock_completed(&self) -> MutexGuard<'_, BTreeSet<u32>> {
        self.completed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Batches currently executing, keyed by job and batch index.
#[derive(Default)]
pub struct RunningBatches {
    batches: Mutex<HashMap<(JobId, u32), Arc<BatchHandle>>>,
}

impl RunningBatches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a batch, returning its handle.
    pub fn register(&self, batch: &Batch) -> Arc<BatchHandle> {
        let handle = BatchHandle::new(batch.clone());
        self.lock()
            .insert((batch.job_id.clone(), batch.index), Arc::clone(&handle));
        handle
    }

    pub fn remove(&self, batch: &Batch) {
        self.lock().remove(&(batch.job_id.clone(), batch.index));
    }

    /// Running batches of a job; only `batch_index` when given.
    pub fn for_job(&self, job_id: &JobId, batch_index: Option<u32>) -> Vec<Arc<BatchHandle>> {
        self.lock()
            .iter()
            .filter(|((job, index), _)| job == job_id && batch_index.map_or(true, |i| i == *index))
            .map(|(_, handle)| Arc::clone(handle))
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<BatchHandle>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(JobId, u32), Arc<BatchHandle>>> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner())
    }
}
