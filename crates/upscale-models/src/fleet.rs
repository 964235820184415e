//! Fleet capacity, preemption notices and fallback strategies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::job::JobId;

/// Current spot capacity of an execution fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FleetCapacity {
    /// Interruptible units currently running
    pub fulfilled: u32,
    /// Interruptible units requested
    pub target: u32,
    /// Current on-demand fallback target
    #[serde(default)]
    pub on_demand_target: u32,
}

impl FleetCapacity {
    pub fn new(fulfilled: u32, target: u32) -> Self {
        Self {
            fulfilled,
            target,
            on_demand_target: 0,
        }
    }

    /// `fulfilled / target * 100`. A fleet with no target is fully served.
    pub fn fulfillment_percent(&self) -> f64 {
        if self.target == 0 {
            return 100.0;
        }
        self.fulfilled as f64 / self.target as f64 * 100.0
    }

    /// Requested units that are not running.
    pub fn missing(&self) -> u32 {
        self.target.saturating_sub(self.fulfilled)
    }

    /// Fulfillment counting on-demand units toward the target.
    pub fn effective_fulfillment_percent(&self) -> f64 {
        if self.target == 0 {
            return 100.0;
        }
        let effective = self.fulfilled.saturating_add(self.on_demand_target);
        (effective as f64 / self.target as f64 * 100.0).min(100.0)
    }
}

/// How aggressively the controller falls back to on-demand capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackTier {
    /// Fulfillment below 50%
    Severe,
    /// Fulfillment between 50% and 80%
    Moderate,
    /// Fulfillment above 80%
    Minor,
}

impl FallbackTier {
    /// Tier for a fulfillment percentage. 50 and 80 are moderate.
    pub fn for_fulfillment(percent: f64) -> Self {
        if percent < 50.0 {
            FallbackTier::Severe
        } else if percent <= 80.0 {
            FallbackTier::Moderate
        } else {
            FallbackTier::Minor
        }
    }

    /// Share of the missing capacity to replace, as `(numerator, denominator)`.
    pub fn replacement_ratio(&self) -> (u32, u32) {
        match self {
            FallbackTier::Severe => (3, 4),
            FallbackTier::Moderate => (1, 2),
            FallbackTier::Minor => (1, 4),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackTier::Severe => "severe",
            FallbackTier::Moderate => "moderate",
            FallbackTier::Minor => "minor",
        }
    }
}

impl fmt::Display for FallbackTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fallback strategy chosen for a capacity shortfall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackDecision {
    pub tier: FallbackTier,
    pub fulfillment_percent: f64,
    pub missing_capacity: u32,
    /// On-demand units requested for this shortfall
    pub on_demand_count: u32,
    /// On-demand target applied to the fleet
    pub applied_target: u32,
    pub decided_at: DateTime<Utc>,
}

/// One batch an instance is currently executing.
///
/// An instance running several batches holds one assignment per batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAssignment {
    pub instance_id: String,
    pub job_id: JobId,
    pub batch_index: u32,
    pub execution_id: String,
    pub assigned_at: DateTime<Utc>,
}

impl InstanceAssignment {
    /// Key of the batch slot within the instance, `{job_id}:{batch_index}`.
    pub fn slot(&self) -> String {
        assignment_slot(&self.job_id, self.batch_index)
    }
}

pub fn assignment_slot(job_id: &JobId, batch_index: u32) -> String {
    format!("{}:{}", job_id, batch_index)
}

/// Asynchronous notice that an instance is about to be reclaimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptionNotice {
    pub instance_id: String,
    /// Forced termination time
    pub deadline: DateTime<Utc>,
}

impl InterruptionNotice {
    pub fn new(instance_id: impl Into<String>, deadline: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.into(),
            deadline,
        }
    }

    /// Time left until the deadline (zero once it has passed).
    pub fn remaining(&self) -> Duration {
        (self.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fulfillment_percent() {
        let capacity = FleetCapacity::new(4, 10);
        assert_eq!(capacity.fulfillment_percent(), 40.0);
        assert_eq!(capacity.missing(), 6);

        let empty = FleetCapacity::new(0, 0);
        assert_eq!(empty.fulfillment_percent(), 100.0);
        assert_eq!(empty.missing(), 0);
    }

    #[test]
    fn test_effective_fulfillment_counts_on_demand() {
        let capacity = FleetCapacity {
            fulfilled: 4,
            target: 10,
            on_demand_target: 5,
        };
        assert_eq!(capacity.effective_fulfillment_percent(), 90.0);

        let over = FleetCapacity {
            fulfilled: 9,
            target: 10,
            on_demand_target: 4,
        };
        assert_eq!(over.effective_fulfillment_percent(), 100.0);
    }

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(FallbackTier::for_fulfillment(0.0), FallbackTier::Severe);
        assert_eq!(FallbackTier::for_fulfillment(49.9), FallbackTier::Severe);
        assert_eq!(FallbackTier::for_fulfillment(50.0), FallbackTier::Moderate);
        assert_eq!(FallbackTier::for_fulfillment(80.0), FallbackTier::Moderate);
        assert_eq!(FallbackTier::for_fulfillment(80.1), FallbackTier::Minor);
    }

    #[test]
    fn test_assignment_slot_is_per_batch() {
        let assignment = InstanceAssignment {
            instance_id: "i-1".into(),
            job_id: JobId::from_string("job"),
            batch_index: 4,
            execution_id: "e".into(),
            assigned_at: Utc::now(),
        };
        assert_eq!(assignment.slot(), "job:4");
        assert_ne!(assignment.slot(), assignment_slot(&assignment.job_id, 5));
    }

    #[test]
    fn test_remaining_after_deadline_is_zero() {
        let notice = InterruptionNotice::new("i-1", Utc::now() - chrono::Duration::seconds(5));
        assert_eq!(notice.remaining(), Duration::ZERO);

        let notice = InterruptionNotice::new("i-1", Utc::now() + chrono::Duration::seconds(120));
        assert!(notice.remaining() > Duration::from_secs(100));
    }
}
