//! Request/reply channel between the preemption controller and the
//! per-instance worker agents.
//!
//! Commands go to `{prefix}:agent:{instance_id}`; the agent answers on
//! `{prefix}:agent-reply:{request_id}`.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use redis::AsyncCommands;
use tracing::{debug, warn};

use upscale_models::{AgentCommand, AgentReport};

use crate::error::{FleetError, FleetResult};

/// Stream of commands addressed to one instance.
pub type CommandStream = Pin<Box<dyn Stream<Item = AgentCommand> + Send>>;

/// Controller side: deliver a command and wait for the report.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    async fn send(
        &self,
        instance_id: &str,
        command: AgentCommand,
        timeout: Duration,
    ) -> FleetResult<AgentReport>;
}

/// Agent side: receive commands and answer them.
#[async_trait]
pub trait AgentInbox: Send + Sync {
    async fn commands(&self, instance_id: &str) -> FleetResult<CommandStream>;

    async fn reply(&self, report: &AgentReport) -> FleetResult<()>;
}

#[derive(Clone)]
pub struct RedisAgentChannel {
    client: redis::Client,
    prefix: String,
}

impl RedisAgentChannel {
    pub fn new(redis_url: &str, prefix: impl Into<String>) -> FleetResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            prefix: prefix.into(),
        })
    }

    pub fn from_env() -> FleetResult<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let prefix = std::env::var("FLEET_KEY_PREFIX").unwrap_or_else(|_| "upscale".to_string());
        Self::new(&url, prefix)
    }

    fn command_channel(&self, instance_id: &str) -> String {
        format!("{}:agent:{}", self.prefix, instance_id)
    }

    fn reply_channel(&self, request_id: &str) -> String {
        format!("{}:agent-reply:{}", self.prefix, request_id)
    }
}

#[async_trait]
impl AgentChannel for RedisAgentChannel {
    async fn send(
        &self,
        instance_id: &str,
        command: AgentCommand,
        timeout: Duration,
    ) -> FleetResult<AgentReport> {
        // Subscribe before publishing so a fast reply is not missed
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub
            .subscribe(self.reply_channel(command.request_id()))
            .await?;

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let receivers: u32 = conn
            .publish(
                self.command_channel(instance_id),
                serde_json::to_string(&command)?,
            )
            .await?;
        if receivers == 0 {
            return Err(FleetError::AgentUnavailable(instance_id.to_string()));
        }
        debug!(instance_id = %instance_id, request_id = command.request_id(), "Sent agent command");

        let mut replies = Box::pin(pubsub.into_on_message());
        let reply = tokio::time::timeout(timeout, async {
            while let Some(msg) = replies.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                match serde_json::from_str::<AgentReport>(&payload) {
                    Ok(report) => return Some(report),
                    Err(e) => warn!(error = %e, "Ignoring malformed agent report"),
                }
            }
            None
        })
        .await;

        match reply {
            Ok(Some(report)) => Ok(report),
            Ok(None) => Err(FleetError::ChannelClosed(self.reply_channel(command.request_id()))),
            Err(_) => Err(FleetError::AgentTimeout {
                instance_id: instance_id.to_string(),
                timeout,
            }),
        }
    }
}

#[async_trait]
impl AgentInbox for RedisAgentChannel {
    async fn commands(&self, instance_id: &str) -> FleetResult<CommandStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.command_channel(instance_id)).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            match serde_json::from_str(&payload) {
                Ok(command) => Some(command),
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed agent command");
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn reply(&self, report: &AgentReport) -> FleetResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.publish::<_, _, ()>(
            self.reply_channel(&report.request_id),
            serde_json::to_string(report)?,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        let channel = RedisAgentChannel::new("redis://localhost:6379", "upscale").unwrap();
        assert_eq!(channel.command_channel("i-1"), "upscale:agent:i-1");
        assert_eq!(channel.reply_channel("req"), "upscale:agent-reply:req");
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_send_without_agent_is_unavailable() {
        let channel = RedisAgentChannel::from_env().unwrap();
        let err = channel
            .send("i-nobody", AgentCommand::ping(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::AgentUnavailable(_)));
    }
}
