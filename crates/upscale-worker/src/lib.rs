//! Upscale pipeline services.
//!
//! This crate provides:
//! - Batch executor and frame worker running on fleet instances
//! - Worker agent answering checkpoint commands
//! - Pipeline driver (extraction, processing barrier, encoding)
//! - Preemption controller with on-demand fallback
//! - Upload trigger, intermediate compression and cleanup

pub mod agent;
pub mod artifact_cache;
pub mod cleanup;
pub mod compression;
pub mod config;
pub mod error;
pub mod executor;
pub mod frame_worker;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod planner;
pub mod preemption;
pub mod retry;
pub mod running;
pub mod state_machine;
pub mod trigger;

pub use agent::WorkerAgent;
pub use artifact_cache::ArtifactCache;
pub use cleanup::{CleanupReport, IntermediateCleanup};
pub use compression::{CompressionReport, IntermediateCompression};
pub use config::{PipelineConfig, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use executor::BatchExecutor;
pub use frame_worker::FrameWorker;
pub use logging::JobLogger;
pub use pipeline::PipelineDriver;
pub use preemption::{PreemptionController, PreemptionReport};
pub use retry::RetryExecutor;
pub use running::{BatchHandle, RunningBatches};
pub use state_machine::JobStateMachine;
pub use trigger::{JobRequestSink, PipelineTrigger};
