//! Inference error types.

use thiserror::Error;

pub type InferenceResult<T> = Result<T, InferenceError>;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Inference endpoint not configured: {0}")]
    Config(String),

    #[error("Inference endpoint returned {status}: {message}")]
    Endpoint { status: u16, message: String },

    #[error("Invalid inference response: {0}")]
    InvalidResponse(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl InferenceError {
    pub fn endpoint(status: u16, message: impl Into<String>) -> Self {
        Self::Endpoint {
            status,
            message: message.into(),
        }
    }

    /// Every endpoint failure is treated as transient; only a missing
    /// configuration is permanent.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, InferenceError::Config(_))
    }
}
