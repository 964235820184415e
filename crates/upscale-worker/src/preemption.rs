//! Preemption controller.
//!
//! On an interruption notice: pause every job the instance is working on,
//! have the instance's agent checkpoint them within the notice deadline, and
//! request on-demand capacity for the shortfall.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{error, info, warn};

use upscale_fleet::{AgentChannel, ExecutionFleet, FleetError, InterruptionSource};
use upscale_jobstore::{JobStore, JobStoreError};
use upscale_models::{
    AgentCommand, AgentReport, FallbackDecision, FallbackTier, FleetCapacity, InterruptionNotice,
    InterruptionRecord, JobId, JobStage,
};

use crate::error::WorkerResult;
use crate::metrics;
use crate::retry::RetryExecutor;
use crate::state_machine::JobStateMachine;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// What the controller did for one notice.
#[derive(Debug, Default)]
pub struct PreemptionReport {
    /// Jobs the preempted instance was working on
    pub job_ids: Vec<JobId>,
    /// Agent replies, one per checkpointed job
    pub checkpoints: Vec<AgentReport>,
    pub fallback: Option<FallbackDecision>,
}

/// Fallback for a capacity shortfall, or `None` when nothing is missing.
///
/// Requests `ceil(missing * ratio)` on-demand units (at least one) for the
/// tier of the current fulfillment. The applied target never lowers an
/// existing on-demand target.
pub fn compute_fallback(capacity: &FleetCapacity) -> Option<FallbackDecision> {
    let missing = capacity.missing();
    if missing == 0 {
        return None;
    }

    let fulfillment_percent = capacity.fulfillment_percent();
    let tier = FallbackTier::for_fulfillment(fulfillment_percent);
    let (num, den) = tier.replacement_ratio();
    let on_demand_count = ((missing as u64 * num as u64).div_ceil(den as u64) as u32).max(1);

    Some(FallbackDecision {
        tier,
        fulfillment_percent,
        missing_capacity: missing,
        on_demand_count,
        applied_target: capacity.on_demand_target.max(on_demand_count),
        decided_at: Utc::now(),
    })
}

pub struct PreemptionController {
    jobs: Arc<dyn JobStore>,
    fleet: Arc<dyn ExecutionFleet>,
    agents: Arc<dyn AgentChannel>,
    machine: JobStateMachine,
    fleet_id: String,
    retry: RetryExecutor,
}

impl PreemptionController {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        fleet: Arc<dyn ExecutionFleet>,
        agents: Arc<dyn AgentChannel>,
        fleet_id: impl Into<String>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            machine: JobStateMachine::new(Arc::clone(&jobs), retry.clone()),
            jobs,
            fleet,
            agents,
            fleet_id: fleet_id.into(),
            retry,
        }
    }

    /// Handle notices until shutdown, resubscribing when the stream ends.
    pub async fn run(
        self: Arc<Self>,
        source: Arc<dyn InterruptionSource>,
        mut shutdown: watch::Receiver<bool>,
    ) -> WorkerResult<()> {
        info!(fleet_id = %self.fleet_id, "Preemption controller started");
        loop {
            let mut notices = source.subscribe().await?;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("Preemption controller stopping");
                            return Ok(());
                        }
                    }
                    notice = notices.next() => {
                        let Some(notice) = notice else { break };
                        let controller = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = controller.handle_notice(&notice).await {
                                error!(instance_id = %notice.instance_id, error = %e, "Failed to handle interruption");
                            }
                        });
                    }
                }
            }
            warn!("Interruption stream ended, resubscribing");
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        }
    }

    /// Respond to one interruption notice.
    ///
    /// Checkpoint failures are logged and do not stop the fallback.
    pub async fn handle_notice(&self, notice: &InterruptionNotice) -> WorkerResult<PreemptionReport> {
        metrics::record_preemption();
        info!(
            instance_id = %notice.instance_id,
            deadline = %notice.deadline,
            "Interruption notice"
        );

        let assignments = self
            .retry
            .named("instance_assignments")
            .execute_if(
                || self.fleet.instance_assignments(&notice.instance_id),
                FleetError::is_retryable,
            )
            .await?;
        if assignments.is_empty() {
            info!(instance_id = %notice.instance_id, "Instance had no batch assigned");
        }

        // Batches grouped by job, in assignment order
        let mut by_job: Vec<(JobId, Vec<u32>)> = Vec::new();
        for assignment in assignments {
            match by_job.iter_mut().find(|(job_id, _)| *job_id == assignment.job_id) {
                Some((_, batches)) => batches.push(assignment.batch_index),
                None => by_job.push((assignment.job_id, vec![assignment.batch_index])),
            }
        }

        for (job_id, _) in &by_job {
            self.interrupt_job(job_id, notice).await?;
        }

        // All checkpoints share the notice deadline
        let requests = by_job.iter().map(|(job_id, batches)| {
            let batch_index = match batches.as_slice() {
                [only] => Some(*only),
                _ => None,
            };
            self.request_checkpoint(notice, job_id, batch_index)
        });
        let checkpoints = futures::future::join_all(requests).await;

        let job_ids: Vec<JobId> = by_job.into_iter().map(|(job_id, _)| job_id).collect();
        let fallback = self.apply_fallback(&job_ids).await?;
        Ok(PreemptionReport {
            job_ids,
            checkpoints: checkpoints.into_iter().flatten().collect(),
            fallback,
        })
    }

    async fn interrupt_job(&self, job_id: &JobId, notice: &InterruptionNotice) -> WorkerResult<()> {
        match self
            .machine
            .transition(job_id, JobStage::Processing, JobStage::Interrupted)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_state_conflict() => {
                warn!(job_id = %job_id, error = %e, "Job not processing, leaving stage as is");
            }
            Err(e) => return Err(e),
        }

        let record = InterruptionRecord {
            instance_id: notice.instance_id.clone(),
            interrupted_at: Utc::now(),
        };
        self.retry
            .named("record_interruption")
            .execute_if(
                || self.jobs.record_interruption(job_id, &record),
                JobStoreError::is_retryable,
            )
            .await?;
        Ok(())
    }

    /// Ask the agent to checkpoint one batch, or every batch of the job on
    /// the instance when `batch_index` is `None`.
    async fn request_checkpoint(
        &self,
        notice: &InterruptionNotice,
        job_id: &JobId,
        batch_index: Option<u32>,
    ) -> Option<AgentReport> {
        let remaining = notice.remaining();
        if remaining.is_zero() {
            warn!(instance_id = %notice.instance_id, "Deadline passed, skipping checkpoint");
            return None;
        }

        let command = AgentCommand::checkpoint(job_id.clone(), batch_index, notice.deadline);
        match self.agents.send(&notice.instance_id, command, remaining).await {
            Ok(report) => {
                match &report.error {
                    Some(err) => warn!(
                        instance_id = %notice.instance_id,
                        job_id = %job_id,
                        error = %err,
                        "Checkpoint reported an error"
                    ),
                    None => info!(
                        instance_id = %notice.instance_id,
                        job_id = %job_id,
                        checkpoint = ?report.checkpoint_id,
                        frames = report.frames_checkpointed,
                        "Checkpoint written"
                    ),
                }
                Some(report)
            }
            Err(e) => {
                warn!(instance_id = %notice.instance_id, job_id = %job_id, error = %e, "Checkpoint request failed");
                None
            }
        }
    }

    async fn apply_fallback(&self, job_ids: &[JobId]) -> WorkerResult<Option<FallbackDecision>> {
        let capacity = self
            .retry
            .named("describe_capacity")
            .execute_if(
                || self.fleet.describe_capacity(&self.fleet_id),
                FleetError::is_retryable,
            )
            .await?;

        let Some(decision) = compute_fallback(&capacity) else {
            return Ok(None);
        };

        self.retry
            .named("set_on_demand_target")
            .execute_if(
                || self.fleet.set_on_demand_target(&self.fleet_id, decision.applied_target),
                FleetError::is_retryable,
            )
            .await?;
        metrics::record_fallback(decision.tier, decision.on_demand_count);
        info!(
            fleet_id = %self.fleet_id,
            tier = %decision.tier,
            fulfillment_percent = decision.fulfillment_percent,
            missing = decision.missing_capacity,
            on_demand = decision.on_demand_count,
            target = decision.applied_target,
            "Applied on-demand fallback"
        );

        for job_id in job_ids {
            self.retry
                .named("record_fallback")
                .execute_if(
                    || self.jobs.record_fallback(job_id, &decision),
                    JobStoreError::is_retryable,
                )
                .await?;
        }
        Ok(Some(decision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use upscale_fleet::{AgentInbox, MemoryAgentChannel, MemoryFleet, MemoryInterruptions};
    use upscale_jobstore::MemoryJobStore;
    use upscale_models::{CheckpointId, InstanceAssignment, Job, ModelType};

    fn capacity(fulfilled: u32, target: u32) -> FleetCapacity {
        FleetCapacity::new(fulfilled, target)
    }

    #[test]
    fn test_fallback_tiers() {
        let severe = compute_fallback(&capacity(4, 10)).unwrap();
        assert_eq!(severe.tier, FallbackTier::Severe);
        assert_eq!(severe.missing_capacity, 6);
        assert_eq!(severe.on_demand_count, 5);

        let moderate = compute_fallback(&capacity(9, 12)).unwrap();
        assert_eq!(moderate.tier, FallbackTier::Moderate);
        assert_eq!(moderate.on_demand_count, 2);

        let minor = compute_fallback(&capacity(9, 10)).unwrap();
        assert_eq!(minor.tier, FallbackTier::Minor);
        assert_eq!(minor.on_demand_count, 1);

        assert!(compute_fallback(&capacity(10, 10)).is_none());
        assert!(compute_fallback(&capacity(0, 0)).is_none());
    }

    #[test]
    fn test_fallback_never_lowers_target() {
        let mut current = capacity(9, 10);
        current.on_demand_target = 4;
        assert_eq!(compute_fallback(&current).unwrap().applied_target, 4);
    }

    struct Setup {
        controller: Arc<PreemptionController>,
        jobs: Arc<MemoryJobStore>,
        fleet: Arc<MemoryFleet>,
        agents: Arc<MemoryAgentChannel>,
        job_id: JobId,
    }

    async fn setup() -> Setup {
        let jobs = Arc::new(MemoryJobStore::new());
        let fleet = Arc::new(MemoryFleet::new());
        let agents = Arc::new(MemoryAgentChannel::new());
        fleet.set_capacity("spot", 4, 10);

        let job = Job::new("a.mp4", "s3://in/a.mp4", "s3://out/a.mp4", ModelType::default());
        jobs.create_job(&job).await.unwrap();
        jobs.force_stage(&job.job_id, JobStage::Processing);
        fleet
            .assign_instance(&InstanceAssignment {
                instance_id: "i-1".to_string(),
                job_id: job.job_id.clone(),
                batch_index: 3,
                execution_id: "exec-1".to_string(),
                assigned_at: Utc::now(),
            })
            .await
            .unwrap();

        let retry = RetryExecutor::new("test").with_base_delay(Duration::from_millis(1));
        let controller = Arc::new(PreemptionController::new(
            jobs.clone(),
            fleet.clone(),
            agents.clone(),
            "spot",
            retry,
        ));
        Setup {
            controller,
            jobs,
            fleet,
            agents,
            job_id: job.job_id,
        }
    }

    /// Agent on `instance` that acknowledges every checkpoint.
    async fn spawn_agent(agents: Arc<MemoryAgentChannel>, instance: &str) {
        let mut commands = agents.commands(instance).await.unwrap();
        let instance = instance.to_string();
        tokio::spawn(async move {
            while let Some(command) = commands.next().await {
                let mut report = AgentReport::new(command.request_id(), &instance);
                report.checkpoint_id = Some(CheckpointId::from_timestamp(Utc::now()));
                report.frames_checkpointed = 7;
                agents.reply(&report).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_notice_interrupts_checkpoints_and_falls_back() {
        let s = setup().await;
        spawn_agent(s.agents.clone(), "i-1").await;

        let notice = InterruptionNotice::new("i-1", Utc::now() + chrono::Duration::seconds(120));
        let report = s.controller.handle_notice(&notice).await.unwrap();

        assert_eq!(report.job_ids, vec![s.job_id.clone()]);
        assert_eq!(report.checkpoints.len(), 1);
        assert_eq!(report.checkpoints[0].frames_checkpointed, 7);
        assert_eq!(report.fallback.as_ref().unwrap().applied_target, 5);

        let job = s.jobs.get_job(&s.job_id).await.unwrap();
        assert_eq!(job.stage, JobStage::Interrupted);
        assert_eq!(job.interruption.unwrap().instance_id, "i-1");
        assert_eq!(job.fallback.unwrap().tier, FallbackTier::Severe);

        let sent = s.agents.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0].1,
            AgentCommand::Checkpoint { batch_index: Some(3), .. }
        ));
        assert_eq!(s.fleet.describe_capacity("spot").await.unwrap().on_demand_target, 5);
    }

    #[tokio::test]
    async fn test_unreachable_agent_still_falls_back() {
        let s = setup().await;

        let notice = InterruptionNotice::new("i-1", Utc::now() + chrono::Duration::seconds(120));
        let report = s.controller.handle_notice(&notice).await.unwrap();

        assert!(report.checkpoints.is_empty());
        assert!(report.fallback.is_some());
        assert_eq!(s.jobs.get_job(&s.job_id).await.unwrap().stage, JobStage::Interrupted);
    }

    #[tokio::test]
    async fn test_expired_notice_skips_checkpoint() {
        let s = setup().await;
        spawn_agent(s.agents.clone(), "i-1").await;

        let notice = InterruptionNotice::new("i-1", Utc::now() - chrono::Duration::seconds(1));
        let report = s.controller.handle_notice(&notice).await.unwrap();

        assert!(report.checkpoints.is_empty());
        assert!(s.agents.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unassigned_instance_leaves_jobs_alone() {
        let s = setup().await;

        let notice = InterruptionNotice::new("i-unknown", Utc::now() + chrono::Duration::seconds(120));
        let report = s.controller.handle_notice(&notice).await.unwrap();

        assert!(report.job_ids.is_empty());
        assert!(report.fallback.is_some());
        assert_eq!(s.jobs.get_job(&s.job_id).await.unwrap().stage, JobStage::Processing);
    }

    #[tokio::test]
    async fn test_notice_covers_every_batch_on_the_instance() {
        let s = setup().await;
        spawn_agent(s.agents.clone(), "i-1").await;

        let other = Job::new("b.mp4", "s3://in/b.mp4", "s3://out/b.mp4", ModelType::default());
        s.jobs.create_job(&other).await.unwrap();
        s.jobs.force_stage(&other.job_id, JobStage::Processing);
        for (job_id, batch_index) in [(&s.job_id, 4), (&other.job_id, 0)] {
            s.fleet
                .assign_instance(&InstanceAssignment {
                    instance_id: "i-1".to_string(),
                    job_id: job_id.clone(),
                    batch_index,
                    execution_id: format!("exec-{}", batch_index),
                    assigned_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let notice = InterruptionNotice::new("i-1", Utc::now() + chrono::Duration::seconds(120));
        let report = s.controller.handle_notice(&notice).await.unwrap();

        assert_eq!(report.job_ids.len(), 2);
        assert_eq!(report.checkpoints.len(), 2);
        for job_id in [&s.job_id, &other.job_id] {
            let job = s.jobs.get_job(job_id).await.unwrap();
            assert_eq!(job.stage, JobStage::Interrupted);
            assert_eq!(job.interruption.unwrap().instance_id, "i-1");
            assert!(job.fallback.is_some());
        }

        // two batches of one job are checkpointed together
        let sent = s.agents.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().any(|(_, command)| matches!(
            command,
            AgentCommand::Checkpoint { job_id, batch_index: None, .. } if *job_id == s.job_id
        )));
        assert!(sent.iter().any(|(_, command)| matches!(
            command,
            AgentCommand::Checkpoint { job_id, batch_index: Some(0), .. } if *job_id == other.job_id
        )));
    }

    #[tokio::test]
    async fn test_run_handles_published_notices() {
        let s = setup().await;
        let source = Arc::new(MemoryInterruptions::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(Arc::clone(&s.controller).run(source.clone(), shutdown_rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        source.notify(InterruptionNotice::new("i-1", Utc::now() + chrono::Duration::seconds(1)));

        for _ in 0..100 {
            if s.jobs.get_job(&s.job_id).await.unwrap().stage == JobStage::Interrupted {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(s.jobs.get_job(&s.job_id).await.unwrap().stage, JobStage::Interrupted);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
