//! Frame batches and their outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

use crate::job::{JobId, ModelType};

/// Resource allotment computed for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePlan {
    /// Frames per batch
    pub batch_size: u32,
    /// Memory per batch execution
    pub memory_mb: u32,
    /// vCPUs per batch execution
    pub vcpus: u32,
    /// `ceil(frame_count / batch_size)`
    pub total_batches: u32,
}

/// A contiguous, inclusive frame range assigned to one worker execution.
///
/// Frames are numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub job_id: JobId,
    /// Position of the batch in the job's partition (0-based)
    pub index: u32,
    pub start_frame: u32,
    pub end_frame: u32,
    pub vcpus: u32,
    pub memory_mb: u32,
    pub model_type: ModelType,
}

impl Batch {
    /// Number of frames in the batch.
    pub fn frame_count(&self) -> u32 {
        self.end_frame - self.start_frame + 1
    }

    pub fn frames(&self) -> RangeInclusive<u32> {
        self.start_frame..=self.end_frame
    }

    pub fn contains(&self, frame: u32) -> bool {
        self.frames().contains(&frame)
    }
}

/// Result of one worker execution of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    /// Every frame in the batch was upscaled and uploaded
    pub success: bool,
    /// Frames completed (including frames skipped because a checkpoint
    /// already covered them)
    pub frames_done: u32,
    /// Frames that failed after the retry budget
    #[serde(default)]
    pub failed_frames: Vec<u32>,
    /// The execution stopped early on request
    #[serde(default)]
    pub interrupted: bool,
}

impl BatchResult {
    pub fn status(&self) -> BatchStatus {
        if self.interrupted {
            BatchStatus::Interrupted
        } else if self.success {
            BatchStatus::Succeeded
        } else {
            BatchStatus::Failed
        }
    }
}

/// Terminal status of a batch execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Succeeded,
    Failed,
    Interrupted,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Succeeded => "succeeded",
            BatchStatus::Failed => "failed",
            BatchStatus::Interrupted => "interrupted",
        }
    }
}

/// Batch completion report written by workers to the job store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub job_id: JobId,
    pub index: u32,
    pub status: BatchStatus,
    pub frames_done: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl BatchOutcome {
    pub fn new(batch: &Batch, status: BatchStatus, frames_done: u32) -> Self {
        Self {
            job_id: batch.job_id.clone(),
            index: batch.index,
            status,
            frames_done,
            error: None,
            instance_id: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn from_result(batch: &Batch, result: &BatchResult) -> Self {
        let mut outcome = Self::new(batch, result.status(), result.frames_done);
        if !result.failed_frames.is_empty() {
            outcome.error = Some(format!("frames failed: {:?}", result.failed_frames));
        }
        outcome
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }
}
