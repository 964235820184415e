//! Work queues on Redis Streams.
//!
//! One stream per message type, consumed through a consumer group. Messages
//! stay pending until acknowledged, so work held by a crashed consumer is
//! picked up again with [`StreamQueue::claim_pending`].

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use upscale_models::{Batch, JobId};

use crate::error::{FleetError, FleetResult};

/// A message that can travel on a [`StreamQueue`].
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync {
    /// Short description for log lines.
    fn describe(&self) -> String;
}

impl QueueMessage for Batch {
    fn describe(&self) -> String {
        format!("{} batch {} [{}-{}]", self.job_id, self.index, self.start_frame, self.end_frame)
    }
}

/// Request to run the pipeline for a newly created job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: JobId,
}

impl QueueMessage for JobRequest {
    fn describe(&self) -> String {
        format!("job {}", self.job_id)
    }
}

/// A consumed message with its stream entry ID.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<T> {
    pub message_id: String,
    pub payload: T,
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Stream name for messages
    pub stream_name: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Dead letter stream name
    pub dlq_stream_name: String,
    /// Deliveries before a message is dead-lettered
    pub max_deliveries: u32,
}

impl QueueConfig {
    /// Batch queue consumed by workers.
    pub fn batches() -> Self {
        Self::from_env_with("BATCH", "upscale:batches", "upscale:workers")
    }

    /// Upload queue consumed by the pipeline controller.
    pub fn uploads() -> Self {
        Self::from_env_with("UPLOAD", "upscale:uploads", "upscale:controllers")
    }

    /// Read `{PREFIX}_STREAM`, `{PREFIX}_CONSUMER_GROUP`, `{PREFIX}_DLQ_STREAM`
    /// and `{PREFIX}_MAX_DELIVERIES`.
    fn from_env_with(prefix: &str, stream: &str, group: &str) -> Self {
        let var = |name: &str| std::env::var(format!("{}_{}", prefix, name)).ok();
        let stream_name = var("STREAM").unwrap_or_else(|| stream.to_string());
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            dlq_stream_name: var("DLQ_STREAM").unwrap_or_else(|| format!("{}:dlq", stream_name)),
            stream_name,
            consumer_group: var("CONSUMER_GROUP").unwrap_or_else(|| group.to_string()),
            max_deliveries: var("MAX_DELIVERIES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
        }
    }
}

/// Typed queue client.
pub struct StreamQueue<T> {
    client: redis::Client,
    config: QueueConfig,
    _message: PhantomData<fn() -> T>,
}

impl<T> Clone for StreamQueue<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            config: self.config.clone(),
            _message: PhantomData,
        }
    }
}

impl<T: QueueMessage> StreamQueue<T> {
    pub fn new(config: QueueConfig) -> FleetResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            config,
            _message: PhantomData,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn connection(&self) -> FleetResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| FleetError::connection_failed(e.to_string()))
    }

    /// Create the consumer group if it does not exist yet.
    pub async fn init(&self) -> FleetResult<()> {
        let mut conn = self.connection().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", self.config.consumer_group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.config.consumer_group);
            }
            Err(e) => return Err(FleetError::Redis(e)),
        }

        Ok(())
    }

    /// Append a message, returning its stream entry ID.
    pub async fn enqueue(&self, message: &T) -> FleetResult<String> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(message)?;

        let message_id: String = redis::cmd("XADD")
            .arg(&self.config.stream_name)
            .arg("*")
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| FleetError::submit_failed(e.to_string()))?;

        info!(
            "Enqueued {} on {} as {}",
            message.describe(),
            self.config.stream_name,
            message_id
        );
        Ok(message_id)
    }

    /// Read new messages for this consumer.
    pub async fn consume(
        &self,
        consumer_name: &str,
        block: Duration,
        count: usize,
    ) -> FleetResult<Vec<Delivery<T>>> {
        let mut conn = self.connection().await?;

        let result: redis::streams::StreamReadReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let mut deliveries = Vec::new();
        for stream_key in result.keys {
            for entry in stream_key.ids {
                if let Some(delivery) = self.decode(entry.id, &entry.map).await {
                    debug!("Consumed {} from stream", delivery.payload.describe());
                    deliveries.push(delivery);
                }
            }
        }

        Ok(deliveries)
    }

    /// Take over messages that another consumer left pending for longer
    /// than `min_idle`.
    pub async fn claim_pending(
        &self,
        consumer_name: &str,
        min_idle: Duration,
        count: usize,
    ) -> FleetResult<Vec<Delivery<T>>> {
        let mut conn = self.connection().await?;

        let pending: redis::streams::StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(min_idle.as_millis() as u64)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut claim = redis::cmd("XCLAIM");
        claim
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg(min_idle.as_millis() as u64);
        for entry in &pending.ids {
            claim.arg(&entry.id);
        }
        let result: redis::streams::StreamClaimReply = claim.query_async(&mut conn).await?;

        let mut deliveries = Vec::new();
        for entry in result.ids {
            if let Some(delivery) = self.decode(entry.id, &entry.map).await {
                info!("Claimed pending {} from stream", delivery.payload.describe());
                deliveries.push(delivery);
            }
        }

        Ok(deliveries)
    }

    async fn decode(
        &self,
        message_id: String,
        fields: &std::collections::HashMap<String, redis::Value>,
    ) -> Option<Delivery<T>> {
        let Some(redis::Value::BulkString(payload)) = fields.get("payload") else {
            warn!("Stream entry {} has no payload", message_id);
            self.ack(&message_id).await.ok();
            return None;
        };
        match serde_json::from_slice::<T>(payload) {
            Ok(payload) => Some(Delivery {
                message_id,
                payload,
            }),
            Err(e) => {
                warn!("Failed to parse message {}: {}", message_id, e);
                // Ack the malformed message to prevent reprocessing
                self.ack(&message_id).await.ok();
                None
            }
        }
    }

    /// Acknowledge and delete a message.
    pub async fn ack(&self, message_id: &str) -> FleetResult<()> {
        let mut conn = self.connection().await?;

        redis::cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        redis::cmd("XDEL")
            .arg(&self.config.stream_name)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        debug!("Acknowledged message: {}", message_id);
        Ok(())
    }

    /// Move a message to the dead letter stream.
    pub async fn dead_letter(&self, delivery: &Delivery<T>, error: &str) -> FleetResult<()> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(&delivery.payload)?;

        redis::cmd("XADD")
            .arg(&self.config.dlq_stream_name)
            .arg("*")
            .arg("payload")
            .arg(&payload)
            .arg("error")
            .arg(error)
            .arg("original_id")
            .arg(&delivery.message_id)
            .query_async::<()>(&mut conn)
            .await?;

        self.ack(&delivery.message_id).await?;

        warn!("Moved {} to DLQ: {}", delivery.payload.describe(), error);
        Ok(())
    }

    /// Count a delivery of a message, returning the total so far.
    pub async fn record_delivery(&self, message_id: &str) -> FleetResult<u32> {
        let mut conn = self.connection().await?;

        let key = format!("{}:deliveries:{}", self.config.stream_name, message_id);
        let count: u32 = conn.incr(&key, 1).await?;
        conn.expire::<_, ()>(&key, 86400).await?;
        Ok(count)
    }

    pub async fn len(&self) -> FleetResult<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = conn.xlen(&self.config.stream_name).await?;
        Ok(len)
    }

    pub fn max_deliveries(&self) -> u32 {
        self.config.max_deliveries
    }
}

/// Worker-side view of the batch queue.
#[async_trait]
pub trait BatchSource: Send + Sync {
    /// Wait up to `block` for new batches.
    async fn receive(
        &self,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> FleetResult<Vec<Delivery<Batch>>>;

    /// Batches abandoned by crashed workers.
    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> FleetResult<Vec<Delivery<Batch>>>;

    async fn ack(&self, message_id: &str) -> FleetResult<()>;

    /// Count a delivery; returns the number of deliveries so far.
    async fn record_delivery(&self, message_id: &str) -> FleetResult<u32>;

    async fn dead_letter(&self, delivery: &Delivery<Batch>, error: &str) -> FleetResult<()>;

    fn max_deliveries(&self) -> u32;
}

#[async_trait]
impl BatchSource for StreamQueue<Batch> {
    async fn receive(
        &self,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> FleetResult<Vec<Delivery<Batch>>> {
        self.consume(consumer, block, count).await
    }

    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> FleetResult<Vec<Delivery<Batch>>> {
        self.claim_pending(consumer, min_idle, count).await
    }

    async fn ack(&self, message_id: &str) -> FleetResult<()> {
        StreamQueue::ack(self, message_id).await
    }

    async fn record_delivery(&self, message_id: &str) -> FleetResult<u32> {
        StreamQueue::record_delivery(self, message_id).await
    }

    async fn dead_letter(&self, delivery: &Delivery<Batch>, error: &str) -> FleetResult<()> {
        StreamQueue::dead_letter(self, delivery, error).await
    }

    fn max_deliveries(&self) -> u32 {
        StreamQueue::max_deliveries(self)
    }
}
