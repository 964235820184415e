//! Execution fleet interface and its Redis implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{debug, info};

use upscale_models::{assignment_slot, Batch, FleetCapacity, InstanceAssignment, JobId};

use crate::error::{FleetError, FleetResult};
use crate::queue::{QueueConfig, StreamQueue};

/// Where batches run and how much interruptible capacity backs them.
#[async_trait]
pub trait ExecutionFleet: Send + Sync {
    /// Queue a batch for execution, returning an execution ID.
    async fn submit(&self, batch: &Batch) -> FleetResult<String>;

    async fn describe_capacity(&self, fleet_id: &str) -> FleetResult<FleetCapacity>;

    /// Set the number of on-demand units backing the fleet.
    async fn set_on_demand_target(&self, fleet_id: &str, count: u32) -> FleetResult<()>;

    /// Record a batch an instance is executing.
    async fn assign_instance(&self, assignment: &InstanceAssignment) -> FleetResult<()>;

    /// Drop one batch from the instance; its other batches stay assigned.
    async fn release_instance(&self, instance_id: &str, job_id: &JobId, batch_index: u32) -> FleetResult<()>;

    /// Every batch currently assigned to the instance.
    async fn instance_assignments(&self, instance_id: &str) -> FleetResult<Vec<InstanceAssignment>>;
}

/// Fleet backed by a Redis Streams batch queue.
///
/// Capacity lives in the hash `{prefix}:fleet:{fleet_id}` (fields
/// `fulfilled`, `target`, `on_demand_target`), kept current by the
/// provisioning side through [`RedisFleet::report_capacity`]. Instance
/// assignments live in the hash `{prefix}:instance:{instance_id}`, one
/// field per `{job_id}:{batch_index}`.
#[derive(Clone)]
pub struct RedisFleet {
    client: redis::Client,
    batches: StreamQueue<Batch>,
    prefix: String,
}

impl RedisFleet {
    pub fn new(config: QueueConfig, prefix: impl Into<String>) -> FleetResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            batches: StreamQueue::new(config)?,
            prefix: prefix.into(),
        })
    }

    pub fn from_env() -> FleetResult<Self> {
        let prefix = std::env::var("FLEET_KEY_PREFIX").unwrap_or_else(|_| "upscale".to_string());
        Self::new(QueueConfig::batches(), prefix)
    }

    /// Create the batch consumer group.
    pub async fn init(&self) -> FleetResult<()> {
        self.batches.init().await
    }

    fn capacity_key(&self, fleet_id: &str) -> String {
        format!("{}:fleet:{}", self.prefix, fleet_id)
    }

    fn instance_key(&self, instance_id: &str) -> String {
        format!("{}:instance:{}", self.prefix, instance_id)
    }

    async fn connection(&self) -> FleetResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| FleetError::connection_failed(e.to_string()))
    }

    /// Publish the running and requested interruptible capacity.
    pub async fn report_capacity(&self, fleet_id: &str, fulfilled: u32, target: u32) -> FleetResult<()> {
        let mut conn = self.connection().await?;
        conn.hset_multiple::<_, _, _, ()>(
            self.capacity_key(fleet_id),
            &[("fulfilled", fulfilled), ("target", target)],
        )
        .await?;
        Ok(())
    }
}

fn parse_capacity(fields: &HashMap<String, u32>) -> FleetCapacity {
    let get = |name: &str| fields.get(name).copied().unwrap_or(0);
    FleetCapacity {
        fulfilled: get("fulfilled"),
        target: get("target"),
        on_demand_target: get("on_demand_target"),
    }
}

#[async_trait]
impl ExecutionFleet for RedisFleet {
    async fn submit(&self, batch: &Batch) -> FleetResult<String> {
        self.batches.enqueue(batch).await
    }

    async fn describe_capacity(&self, fleet_id: &str) -> FleetResult<FleetCapacity> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, u32> = conn.hgetall(self.capacity_key(fleet_id)).await?;
        if fields.is_empty() {
            return Err(FleetError::FleetNotFound(fleet_id.to_string()));
        }
        Ok(parse_capacity(&fields))
    }

    async fn set_on_demand_target(&self, fleet_id: &str, count: u32) -> FleetResult<()> {
        let mut conn = self.connection().await?;
        conn.hset::<_, _, _, ()>(self.capacity_key(fleet_id), "on_demand_target", count)
            .await?;
        info!(fleet_id = %fleet_id, on_demand_target = count, "Updated on-demand target");
        Ok(())
    }

    async fn assign_instance(&self, assignment: &InstanceAssignment) -> FleetResult<()> {
        let mut conn = self.connection().await?;
        conn.hset::<_, _, _, ()>(
            self.instance_key(&assignment.instance_id),
            assignment.slot(),
            serde_json::to_string(assignment)?,
        )
        .await?;
        debug!(
            instance_id = %assignment.instance_id,
            job_id = %assignment.job_id,
            batch = assignment.batch_index,
            "Instance assigned"
        );
        Ok(())
    }

    async fn release_instance(&self, instance_id: &str, job_id: &JobId, batch_index: u32) -> FleetResult<()> {
        let mut conn = self.connection().await?;
        conn.hdel::<_, _, ()>(self.instance_key(instance_id), assignment_slot(job_id, batch_index))
            .await?;
        Ok(())
    }

    async fn instance_assignments(&self, instance_id: &str) -> FleetResult<Vec<InstanceAssignment>> {
        let mut conn = self.connection().await?;
        let raw: HashMap<String, String> = conn.hgetall(self.instance_key(instance_id)).await?;
        let mut assignments = raw
            .values()
            .map(|r| serde_json::from_str(r).map_err(FleetError::from))
            .collect::<FleetResult<Vec<InstanceAssignment>>>()?;
        assignments.sort_by_key(|a| a.assigned_at);
        Ok(assignments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_capacity_defaults_missing_fields() {
        let mut fields = HashMap::new();
        fields.insert("fulfilled".to_string(), 4);
        fields.insert("target".to_string(), 10);

        let capacity = parse_capacity(&fields);
        assert_eq!(capacity.fulfilled, 4);
        assert_eq!(capacity.target, 10);
        assert_eq!(capacity.on_demand_target, 0);
        assert_eq!(capacity.missing(), 6);
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_redis_capacity_and_assignments() {
        use chrono::Utc;
        use upscale_models::JobId;

        let prefix = format!("upscale-test-{}", JobId::new());
        let fleet = RedisFleet::new(QueueConfig::batches(), prefix).unwrap();

        fleet.report_capacity("spot", 3, 10).await.unwrap();
        fleet.set_on_demand_target("spot", 2).await.unwrap();
        let capacity = fleet.describe_capacity("spot").await.unwrap();
        assert_eq!(capacity.on_demand_target, 2);
        assert_eq!(capacity.missing(), 7);

        let job_id = JobId::from_string("job");
        let assignment = |batch_index| InstanceAssignment {
            instance_id: "i-1".into(),
            job_id: job_id.clone(),
            batch_index,
            execution_id: format!("exec-{}", batch_index),
            assigned_at: Utc::now(),
        };
        fleet.assign_instance(&assignment(3)).await.unwrap();
        fleet.assign_instance(&assignment(4)).await.unwrap();
        assert_eq!(fleet.instance_assignments("i-1").await.unwrap().len(), 2);

        fleet.release_instance("i-1", &job_id, 3).await.unwrap();
        let left = fleet.instance_assignments("i-1").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].batch_index, 4);
        fleet.release_instance("i-1", &job_id, 4).await.unwrap();
        assert!(fleet.instance_assignments("i-1").await.unwrap().is_empty());
    }
}
