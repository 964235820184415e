//! Object storage for the upscale pipeline.
//!
//! This crate provides:
//! - The `ObjectStore` interface (get/put/head/list/delete)
//! - An S3-compatible client implementation
//! - The object key layout shared by every stage
//! - Checkpoint manifests (gzip-compressed JSON, create-only)
//! - Prefix deletion helpers used by intermediate cleanup

pub mod checkpoint;
pub mod client;
pub mod error;
pub mod keys;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod operations;
pub mod store;

pub use checkpoint::CheckpointStore;
pub use client::{S3Client, S3Config};
pub use error::{StorageError, StorageResult};
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryBuckets, MemoryObjectStore};
pub use operations::{delete_prefix, DELETE_BATCH_SIZE};
pub use store::{BucketResolver, ObjectInfo, ObjectStore, StoredObject};
