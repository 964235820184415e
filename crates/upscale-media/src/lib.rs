//! FFmpeg CLI wrapper for the upscale pipeline.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building
//! - Progress parsing from `-progress pipe:2`
//! - Cancellation and timeouts via tokio
//! - Probing, frame extraction, audio extraction and re-encoding

pub mod codec;
pub mod command;
pub mod error;
pub mod probe;
pub mod progress;

pub use codec::{list_frames, FfmpegCodec, VideoCodec, AUDIO_EXTENSION, FRAME_PATTERN};
pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use probe::{probe_video, VideoInfo};
pub use progress::FfmpegProgress;
