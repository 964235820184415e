//! Job processing stages and the transition guard.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Processing stage of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStage {
    /// Job record created, nothing started yet
    #[default]
    Initiated,
    /// Frames and audio are being extracted from the source video
    Extracting,
    /// Batches are being upscaled by the fleet
    Processing,
    /// Upscaled frames are being recomposed into the output video
    Encoding,
    /// Output video uploaded
    Completed,
    /// Job failed irrecoverably
    Failed,
    /// Processing paused because a worker instance was preempted
    Interrupted,
}

/// A stage change that the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid stage transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStage,
    pub to: JobStage,
}

impl JobStage {
    /// All stages, in lifecycle order.
    pub const ALL: [JobStage; 7] = [
        JobStage::Initiated,
        JobStage::Extracting,
        JobStage::Processing,
        JobStage::Encoding,
        JobStage::Completed,
        JobStage::Failed,
        JobStage::Interrupted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Initiated => "INITIATED",
            JobStage::Extracting => "EXTRACTING",
            JobStage::Processing => "PROCESSING",
            JobStage::Encoding => "ENCODING",
            JobStage::Completed => "COMPLETED",
            JobStage::Failed => "FAILED",
            JobStage::Interrupted => "INTERRUPTED",
        }
    }

    /// Check if this is a terminal stage (no more transitions expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStage::Completed | JobStage::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Stages only advance forward. `FAILED` is reachable from every
    /// non-terminal stage and `INTERRUPTED` only from `PROCESSING`, which
    /// is also the only stage an interrupted job may resume to.
    pub fn can_transition_to(&self, next: JobStage) -> bool {
        use JobStage::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Initiated, Extracting) => true,
            (Extracting, Processing) => true,
            (Processing, Encoding) => true,
            (Processing, Interrupted) => true,
            (Interrupted, Processing) => true,
            (Encoding, Completed) => true,
            _ => false,
        }
    }

    /// Validate a transition, returning the target stage.
    pub fn transition(self, next: JobStage) -> Result<JobStage, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job stage: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            JobStage::Initiated,
            JobStage::Extracting,
            JobStage::Processing,
            JobStage::Encoding,
            JobStage::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_interrupt_and_resume_only_from_processing() {
        assert!(JobStage::Processing.can_transition_to(JobStage::Interrupted));
        assert!(JobStage::Interrupted.can_transition_to(JobStage::Processing));

        assert!(!JobStage::Extracting.can_transition_to(JobStage::Interrupted));
        assert!(!JobStage::Encoding.can_transition_to(JobStage::Interrupted));
        assert!(!JobStage::Interrupted.can_transition_to(JobStage::Encoding));
    }

    #[test]
    fn test_failed_reachable_from_non_terminal_stages() {
        for stage in JobStage::ALL {
            assert_eq!(
                stage.can_transition_to(JobStage::Failed),
                !stage.is_terminal(),
                "{}",
                stage
            );
        }
    }

    #[test]
    fn test_no_regressions() {
        // Every backwards move other than the resume edge is rejected.
        let order = [
            JobStage::Initiated,
            JobStage::Extracting,
            JobStage::Processing,
            JobStage::Encoding,
            JobStage::Completed,
        ];
        for (i, later) in order.iter().enumerate() {
            for earlier in &order[..i] {
                assert!(!later.can_transition_to(*earlier), "{} -> {}", later, earlier);
            }
        }
        assert!(!JobStage::Completed.can_transition_to(JobStage::Processing));
        assert!(!JobStage::Failed.can_transition_to(JobStage::Processing));
    }

    #[test]
    fn test_transition_error() {
        let err = JobStage::Completed
            .transition(JobStage::Extracting)
            .unwrap_err();
        assert_eq!(err.from, JobStage::Completed);
        assert_eq!(err.to, JobStage::Extracting);
        assert_eq!(
            JobStage::Processing.transition(JobStage::Encoding),
            Ok(JobStage::Encoding)
        );
    }

    #[test]
    fn test_parse_round_trip() {
        for stage in JobStage::ALL {
            assert_eq!(stage.as_str().parse::<JobStage>().unwrap(), stage);
        }
        assert!("paused".parse::<JobStage>().is_err());
        assert_eq!(
            serde_json::to_string(&JobStage::Interrupted).unwrap(),
            "\"INTERRUPTED\""
        );
    }
}
