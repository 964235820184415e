//! Preemption checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::job::JobId;

/// Timestamp-derived checkpoint identifier.
///
/// Formatted so that lexicographic order equals capture order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub String);

impl CheckpointId {
    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Self(ts.format("%Y%m%dT%H%M%S%.3fZ").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of a job's completed work, taken when an instance is preempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: JobId,
    pub checkpoint_id: CheckpointId,
    /// Instance that wrote the checkpoint
    pub instance_id: String,
    /// Batch that was running on the instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<u32>,
    /// Artifact keys known to be complete
    pub manifest: Vec<String>,
    pub captured_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        job_id: JobId,
        instance_id: impl Into<String>,
        batch_index: Option<u32>,
        mut manifest: Vec<String>,
    ) -> Self {
        let captured_at = Utc::now();
        manifest.sort();
        manifest.dedup();
        Self {
            job_id,
            checkpoint_id: CheckpointId::from_timestamp(captured_at),
            instance_id: instance_id.into(),
            batch_index,
            manifest,
            captured_at,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.manifest.binary_search_by(|k| k.as_str().cmp(key)).is_ok()
    }
}
