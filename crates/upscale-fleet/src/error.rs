//! Fleet error types.

use std::time::Duration;

use thiserror::Error;

pub type FleetResult<T> = Result<T, FleetError>;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Submit failed: {0}")]
    SubmitFailed(String),

    #[error("Fleet not found: {0}")]
    FleetNotFound(String),

    #[error("No agent listening for instance {0}")]
    AgentUnavailable(String),

    #[error("Agent on instance {instance_id} did not reply within {timeout:?}")]
    AgentTimeout {
        instance_id: String,
        timeout: Duration,
    },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FleetError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn submit_failed(msg: impl Into<String>) -> Self {
        Self::SubmitFailed(msg.into())
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            FleetError::ConnectionFailed(_) | FleetError::SubmitFailed(_) => true,
            FleetError::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            _ => false,
        }
    }
}
