//! Job definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::fleet::FallbackDecision;
use crate::job_stage::JobStage;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Frame resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels in one frame.
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Longest side in pixels.
    pub fn max_dimension(&self) -> u32 {
        self.width.max(self.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Super-resolution model used by the inference endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ModelType {
    #[default]
    Realesrgan,
    RealesrganAnime,
    Swinir,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Realesrgan => "realesrgan",
            ModelType::RealesrganAnime => "realesrgan-anime",
            ModelType::Swinir => "swinir",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "realesrgan" => Ok(ModelType::Realesrgan),
            "realesrgan-anime" | "anime" => Ok(ModelType::RealesrganAnime),
            "swinir" => Ok(ModelType::Swinir),
            other => Err(format!("unknown model type: {}", other)),
        }
    }
}

/// Which instance was preempted and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptionRecord {
    pub instance_id: String,
    pub interrupted_at: DateTime<Utc>,
}

/// One video's end-to-end processing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub job_id: JobId,

    /// Basename of the uploaded video
    pub video_name: String,

    /// Source video location (`s3://bucket/key`)
    pub source_location: String,

    /// Where the recomposed video is written (`s3://bucket/key`)
    pub output_location: String,

    /// Total number of frames, known after probing
    #[serde(default)]
    pub frame_count: u32,

    #[serde(default)]
    pub resolution: Resolution,

    #[serde(default)]
    pub frame_rate: f64,

    /// Audio codec of the source, if it has an audio track
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,

    #[serde(default)]
    pub model_type: ModelType,

    #[serde(default)]
    pub stage: JobStage,

    #[serde(default)]
    pub frames_extracted: u32,

    #[serde(default)]
    pub frames_processed: u32,

    /// Number of planned batches (0 until PROCESSING)
    #[serde(default)]
    pub batch_count: u32,

    /// Error message (if failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Last preemption observed for this job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interruption: Option<InterruptionRecord>,

    /// Last fallback strategy applied because of this job's preemption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackDecision>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new job in `INITIATED`.
    pub fn new(
        video_name: impl Into<String>,
        source_location: impl Into<String>,
        output_location: impl Into<String>,
        model_type: ModelType,
    ) -> Self {
        Self::with_id(
            JobId::new(),
            video_name,
            source_location,
            output_location,
            model_type,
        )
    }

    /// Create a new job with a pre-generated ID.
    pub fn with_id(
        job_id: JobId,
        video_name: impl Into<String>,
        source_location: impl Into<String>,
        output_location: impl Into<String>,
        model_type: ModelType,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            video_name: video_name.into(),
            source_location: source_location.into(),
            output_location: output_location.into(),
            frame_count: 0,
            resolution: Resolution::default(),
            frame_rate: 0.0,
            audio_codec: None,
            model_type,
            stage: JobStage::Initiated,
            frames_extracted: 0,
            frames_processed: 0,
            batch_count: 0,
            error_message: None,
            interruption: None,
            fallback: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the job is in a terminal stage.
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Extraction is done when every frame has been extracted.
    pub fn extraction_complete(&self) -> bool {
        self.frame_count > 0 && self.frames_extracted == self.frame_count
    }

    /// All frames upscaled.
    pub fn processing_complete(&self) -> bool {
        self.frame_count > 0 && self.frames_processed == self.frame_count
    }

    /// `frames_processed <= frames_extracted <= frame_count`
    pub fn counters_consistent(&self) -> bool {
        self.frames_processed <= self.frames_extracted && self.frames_extracted <= self.frame_count
    }

    /// Processing progress (0-100).
    pub fn progress_percent(&self) -> u8 {
        if self.frame_count == 0 {
            return 0;
        }
        ((self.frames_processed as u64 * 100) / self.frame_count as u64).min(100) as u8
    }
}
