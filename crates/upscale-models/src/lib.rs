//! Shared data models for the upscale pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs and their processing stages
//! - Frame batches and resource plans
//! - Checkpoints and cache entries
//! - Fleet capacity, interruption notices and agent messages

pub mod agent;
pub mod batch;
pub mod cache;
pub mod checkpoint;
pub mod fleet;
pub mod job;
pub mod job_stage;
pub mod location;

pub use agent::{AgentCommand, AgentReport};
pub use batch::{Batch, BatchOutcome, BatchResult, BatchStatus, ResourcePlan};
pub use cache::CacheEntry;
pub use checkpoint::{Checkpoint, CheckpointId};
pub use fleet::{
    assignment_slot, FallbackDecision, FallbackTier, FleetCapacity, InstanceAssignment,
    InterruptionNotice,
};
pub use job::{InterruptionRecord, Job, JobId, ModelType, Resolution};
pub use job_stage::{InvalidTransition, JobStage};
pub use location::{LocationError, ObjectLocation};
