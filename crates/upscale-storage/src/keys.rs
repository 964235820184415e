//! Object key layout in the intermediate bucket.
//!
//! Everything a job writes lives under `{job_id}/`, which is what the
//! retention cleanup relies on.

/// Content type for PNG frames.
pub const FRAME_CONTENT_TYPE: &str = "image/png";

/// Content type for gzip-compressed JSON.
pub const GZIP_JSON_CONTENT_TYPE: &str = "application/gzip";

/// Content type for any other gzip-compressed object.
pub const GZIP_CONTENT_TYPE: &str = "application/gzip";

/// Local/remote file name of a frame (frames are numbered from 1).
pub fn frame_file_name(frame: u32) -> String {
    format!("{:06}.png", frame)
}

/// Parse a frame number back out of a file name produced by [`frame_file_name`].
pub fn frame_number(file_name: &str) -> Option<u32> {
    file_name.strip_suffix(".png")?.parse().ok()
}

/// Format: `{job_id}/frames/{frame:06}.png`
pub fn source_frame_key(job_id: &str, frame: u32) -> String {
    format!("{}/frames/{}", job_id, frame_file_name(frame))
}

/// Format: `{job_id}/upscaled/{frame:06}.png`
pub fn upscaled_frame_key(job_id: &str, frame: u32) -> String {
    format!("{}/upscaled/{}", job_id, frame_file_name(frame))
}

/// Prefix of all upscaled frames of a job.
pub fn upscaled_prefix(job_id: &str) -> String {
    format!("{}/upscaled/", job_id)
}

/// Format: `{job_id}/audio/audio.{ext}`
pub fn audio_key(job_id: &str, extension: &str) -> String {
    format!("{}/audio/audio.{}", job_id, extension)
}

pub fn checkpoint_prefix(job_id: &str) -> String {
    format!("{}/checkpoints/", job_id)
}

/// Format: `{job_id}/checkpoints/{checkpoint_id}-{instance_id}.json.gz`
///
/// Sorting keys under the prefix sorts checkpoints by capture time.
pub fn checkpoint_key(job_id: &str, checkpoint_id: &str, instance_id: &str) -> String {
    format!(
        "{}{}-{}.json.gz",
        checkpoint_prefix(job_id),
        checkpoint_id,
        instance_id
    )
}

/// Format: `{job_id}/logs/{instance_id}-{checkpoint_id}.log`
pub fn log_key(job_id: &str, instance_id: &str, checkpoint_id: &str) -> String {
    format!("{}/logs/{}-{}.log", job_id, instance_id, checkpoint_id)
}

/// Prefix covering every object of a job.
pub fn job_prefix(job_id: &str) -> String {
    format!("{}/", job_id)
}

/// First key segment, which is the owning job's ID.
pub fn job_id_from_key(key: &str) -> Option<&str> {
    key.split('/').next().filter(|s| !s.is_empty() && key.contains('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_keys() {
        assert_eq!(source_frame_key("job-1", 7), "job-1/frames/000007.png");
        assert_eq!(upscaled_frame_key("job-1", 1200), "job-1/upscaled/001200.png");
        assert_eq!(frame_number("001200.png"), Some(1200));
        assert_eq!(frame_number("audio.aac"), None);
    }

    #[test]
    fn test_checkpoint_keys_sort_by_id() {
        let a = checkpoint_key("job", "20240101T000000.000Z", "i-9");
        let b = checkpoint_key("job", "20240101T000001.000Z", "i-1");
        assert!(a < b);
        assert!(a.starts_with(&checkpoint_prefix("job")));
    }

    #[test]
    fn test_job_id_from_key() {
        assert_eq!(job_id_from_key("job-1/frames/000001.png"), Some("job-1"));
        assert_eq!(job_id_from_key("stray.txt"), None);
        assert_eq!(job_id_from_key("/leading"), None);
    }
}
