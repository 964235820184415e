//! Prometheus metrics for workers and the controller.

use std::net::SocketAddr;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use upscale_models::{BatchStatus, FallbackTier, JobStage};

/// Metric names as constants for consistency.
pub mod names {
    pub const FRAMES_PROCESSED_TOTAL: &str = "upscale_frames_processed_total";
    pub const FRAME_FAILURES_TOTAL: &str = "upscale_frame_failures_total";
    pub const FRAME_DURATION_SECONDS: &str = "upscale_frame_duration_seconds";
    pub const RETRIES_TOTAL: &str = "upscale_retries_total";
    pub const CACHE_HITS_TOTAL: &str = "upscale_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "upscale_cache_misses_total";
    pub const BATCHES_TOTAL: &str = "upscale_batches_total";
    pub const PREEMPTIONS_TOTAL: &str = "upscale_preemptions_total";
    pub const FALLBACK_UNITS: &str = "upscale_fallback_units";
    pub const STAGE_TRANSITIONS_TOTAL: &str = "upscale_stage_transitions_total";
}

/// Install the Prometheus recorder with an HTTP listener.
///
/// Reads `METRICS_ADDR`; metrics are disabled when it is unset.
pub fn install_exporter() -> anyhow::Result<()> {
    let Ok(addr) = std::env::var("METRICS_ADDR") else {
        return Ok(());
    };
    let addr: SocketAddr = addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!(addr = %addr, "Prometheus exporter listening");
    Ok(())
}

pub fn record_frame_processed(duration_secs: f64) {
    counter!(names::FRAMES_PROCESSED_TOTAL).increment(1);
    histogram!(names::FRAME_DURATION_SECONDS).record(duration_secs);
}

pub fn record_frame_failure() {
    counter!(names::FRAME_FAILURES_TOTAL).increment(1);
}

pub fn record_retry(operation: &str) {
    let labels = [("operation", operation.to_string())];
    counter!(names::RETRIES_TOTAL, &labels).increment(1);
}

pub fn record_cache_hit() {
    counter!(names::CACHE_HITS_TOTAL).increment(1);
}

pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

pub fn record_batch(status: BatchStatus) {
    let labels = [("status", status.as_str().to_string())];
    counter!(names::BATCHES_TOTAL, &labels).increment(1);
}

pub fn record_preemption() {
    counter!(names::PREEMPTIONS_TOTAL).increment(1);
}

pub fn record_fallback(tier: FallbackTier, units: u32) {
    let labels = [("tier", tier.as_str().to_string())];
    histogram!(names::FALLBACK_UNITS, &labels).record(units as f64);
}

pub fn record_stage_transition(from: JobStage, to: JobStage) {
    let labels = [("from", from.as_str().to_string()), ("to", to.as_str().to_string())];
    counter!(names::STAGE_TRANSITIONS_TOTAL, &labels).increment(1);
}
