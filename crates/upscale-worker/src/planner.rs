//! Resource estimation and batch partitioning.

use upscale_models::{Batch, JobId, ModelType, ResourcePlan, Resolution};

pub const MIN_MEMORY_MB: u32 = 2048;
pub const MAX_MEMORY_MB: u32 = 30720;
pub const MIN_VCPUS: u32 = 2;
pub const MAX_VCPUS: u32 = 16;

/// Frames per batch for a video of `frame_count` frames.
pub fn batch_size_for(frame_count: u32) -> u32 {
    match frame_count {
        0..=200 => 5,
        201..=500 => 10,
        501..=1000 => 15,
        _ => 20,
    }
}

/// Size batches and their memory/CPU allotment.
///
/// Deterministic for a given input. Memory covers one RGBA buffer per frame
/// in the batch on top of a 2 GiB base.
pub fn plan(frame_count: u32, resolution: Resolution) -> ResourcePlan {
    let batch_size = batch_size_for(frame_count);

    let batch_mb = resolution
        .pixels()
        .saturating_mul(4)
        .saturating_mul(batch_size as u64)
        / 1_048_576;
    let memory_mb = (MIN_MEMORY_MB as u64 + batch_mb).clamp(MIN_MEMORY_MB as u64, MAX_MEMORY_MB as u64) as u32;

    let vcpus = (memory_mb / 4096 + 2).clamp(MIN_VCPUS, MAX_VCPUS);

    ResourcePlan {
        batch_size,
        memory_mb,
        vcpus,
        total_batches: frame_count.div_ceil(batch_size),
    }
}

/// Split `[1, frame_count]` into contiguous batches of `plan.batch_size`
/// frames; the last batch takes the remainder.
pub fn partition(job_id: &JobId, frame_count: u32, plan: &ResourcePlan, model_type: ModelType) -> Vec<Batch> {
    (0..plan.total_batches)
        .map(|index| {
            let start_frame = index * plan.batch_size + 1;
            let end_frame = (start_frame + plan.batch_size - 1).min(frame_count);
            Batch {
                job_id: job_id.clone(),
                index,
                start_frame,
                end_frame,
                vcpus: plan.vcpus,
                memory_mb: plan.memory_mb,
                model_type,
            }
        })
        .collect()
}
