//! Execution fleet plumbing for the upscale pipeline.
//!
//! This crate provides:
//! - Typed work queues on Redis Streams (batches, uploads) with claim/DLQ
//! - The `ExecutionFleet` interface: submission, capacity and instance directory
//! - Interruption notices via Redis Pub/Sub
//! - The request/reply channel to per-instance worker agents

pub mod agent;
pub mod error;
pub mod fleet;
pub mod interruption;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod queue;

pub use agent::{AgentChannel, AgentInbox, CommandStream, RedisAgentChannel};
pub use error::{FleetError, FleetResult};
pub use fleet::{ExecutionFleet, RedisFleet};
pub use interruption::{InterruptionSource, NoticeStream, RedisInterruptions};
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryAgentChannel, MemoryFleet, MemoryInterruptions};
pub use queue::{BatchSource, Delivery, JobRequest, QueueConfig, QueueMessage, StreamQueue};
