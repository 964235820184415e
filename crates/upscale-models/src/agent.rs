//! Typed messages exchanged with the per-instance worker agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkpoint::CheckpointId;
use crate::job::JobId;

/// Command sent by the controller to a worker agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    /// Stop taking new frames, flush uploads, write a checkpoint and upload logs.
    Checkpoint {
        request_id: String,
        job_id: JobId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_index: Option<u32>,
        deadline: DateTime<Utc>,
    },
    /// Liveness check.
    Ping { request_id: String },
}

impl AgentCommand {
    pub fn checkpoint(job_id: JobId, batch_index: Option<u32>, deadline: DateTime<Utc>) -> Self {
        AgentCommand::Checkpoint {
            request_id: Uuid::new_v4().to_string(),
            job_id,
            batch_index,
            deadline,
        }
    }

    pub fn ping() -> Self {
        AgentCommand::Ping {
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            AgentCommand::Checkpoint { request_id, .. } | AgentCommand::Ping { request_id } => {
                request_id
            }
        }
    }
}

/// Structured reply from a worker agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReport {
    pub request_id: String,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,
    #[serde(default)]
    pub frames_checkpointed: u32,
    #[serde(default)]
    pub uploads_flushed: bool,
    #[serde(default)]
    pub logs_uploaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl AgentReport {
    pub fn new(request_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            instance_id: instance_id.into(),
            checkpoint_id: None,
            frames_checkpointed: 0,
            uploads_flushed: false,
            logs_uploaded: false,
            error: None,
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let command = AgentCommand::checkpoint(JobId::from_string("job-9"), Some(3), Utc::now());
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["type"], "checkpoint");
        assert_eq!(json["job_id"], "job-9");
        assert_eq!(json["batch_index"], 3);

        let decoded: AgentCommand = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.request_id(), command.request_id());
    }
}
