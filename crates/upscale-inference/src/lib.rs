//! Client for the super-resolution inference endpoint.
//!
//! The endpoint reads a frame from a path on the shared working volume,
//! upscales it, and writes the result to the requested output path.

pub mod client;
pub mod error;

pub use client::{InferenceClient, InferenceConfig, InferenceEndpoint, InferenceParams};
pub use error::{InferenceError, InferenceResult};
