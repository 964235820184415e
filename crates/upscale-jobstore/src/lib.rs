//! Job metadata store for the upscale pipeline.
//!
//! This crate provides:
//! - The `JobStore` interface with conditional stage updates and atomic counters
//! - A Redis implementation (hashes, sets and Lua scripts)
//! - An in-memory implementation for tests (`test-util` feature)

pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod redis_store;
pub mod store;

pub use error::{JobStoreError, JobStoreResult};
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryJobStore;
pub use redis_store::{RedisConfig, RedisJobStore};
pub use store::{CounterField, JobMetadata, JobStore};
