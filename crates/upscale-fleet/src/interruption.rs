//! Interruption notices via Redis Pub/Sub.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use redis::AsyncCommands;
use tracing::{debug, warn};

use upscale_models::InterruptionNotice;

use crate::error::FleetResult;

/// Stream of interruption notices.
pub type NoticeStream = Pin<Box<dyn Stream<Item = InterruptionNotice> + Send>>;

/// Source of preemption notices for the fleet.
#[async_trait]
pub trait InterruptionSource: Send + Sync {
    async fn subscribe(&self) -> FleetResult<NoticeStream>;
}

/// Interruption channel on Redis Pub/Sub.
///
/// The cloud-side notice handler publishes to the channel; the preemption
/// controller subscribes.
#[derive(Clone)]
pub struct RedisInterruptions {
    client: redis::Client,
    channel: String,
}

impl RedisInterruptions {
    pub fn new(redis_url: &str, channel: impl Into<String>) -> FleetResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            channel: channel.into(),
        })
    }

    pub fn from_env() -> FleetResult<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let channel = std::env::var("INTERRUPTION_CHANNEL")
            .unwrap_or_else(|_| "upscale:interruptions".to_string());
        Self::new(&url, channel)
    }

    pub async fn publish(&self, notice: &InterruptionNotice) -> FleetResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(notice)?;

        debug!(instance_id = %notice.instance_id, "Publishing interruption notice");
        conn.publish::<_, _, ()>(&self.channel, payload).await?;
        Ok(())
    }
}

#[async_trait]
impl InterruptionSource for RedisInterruptions {
    async fn subscribe(&self) -> FleetResult<NoticeStream> {
        use futures_util::StreamExt;

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            match serde_json::from_str(&payload) {
                Ok(notice) => Some(notice),
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed interruption notice");
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
