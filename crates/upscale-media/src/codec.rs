//! Video decode/encode interface and its FFmpeg implementation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::probe::{probe_video, VideoInfo};

/// File name pattern of extracted frames, numbered from 1.
pub const FRAME_PATTERN: &str = "%06d.png";

/// Container for extracted audio; Matroska accepts any codec as-is.
pub const AUDIO_EXTENSION: &str = "mka";

#[async_trait]
pub trait VideoCodec: Send + Sync {
    async fn probe(&self, video: &Path) -> MediaResult<VideoInfo>;

    /// Decode every frame into `frames_dir` as `000001.png`, `000002.png`...
    ///
    /// Returns the frame files in frame order.
    async fn extract_frames(&self, video: &Path, frames_dir: &Path) -> MediaResult<Vec<PathBuf>>;

    /// Copy the first audio stream into `output` without re-encoding.
    async fn extract_audio(&self, video: &Path, output: &Path) -> MediaResult<()>;

    /// Encode the numbered frames in `frames_dir`, muxing `audio` if given.
    async fn encode(
        &self,
        frames_dir: &Path,
        fps: f64,
        audio: Option<&Path>,
        output: &Path,
    ) -> MediaResult<()>;
}

/// [`VideoCodec`] backed by the `ffmpeg` and `ffprobe` binaries.
#[derive(Debug, Clone)]
pub struct FfmpegCodec {
    timeout_secs: Option<u64>,
    crf: u8,
    preset: String,
}

impl Default for FfmpegCodec {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            crf: 18,
            preset: "medium".to_string(),
        }
    }
}

impl FfmpegCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill FFmpeg runs that take longer than `secs`.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    fn runner(&self) -> FfmpegRunner {
        match self.timeout_secs {
            Some(secs) => FfmpegRunner::new().with_timeout(secs),
            None => FfmpegRunner::new(),
        }
    }

    fn encode_command(
        &self,
        frames_dir: &Path,
        fps: f64,
        audio: Option<&Path>,
        output: &Path,
    ) -> FfmpegCommand {
        let mut cmd = FfmpegCommand::new(frames_dir.join(FRAME_PATTERN), output).framerate(fps);
        if let Some(audio) = audio {
            cmd = cmd.add_input(audio).map("0:v:0").map("1:a:0");
        }
        cmd = cmd
            .video_codec("libx264")
            .pixel_format("yuv420p")
            .crf(self.crf)
            .preset(self.preset.clone());
        if audio.is_some() {
            cmd = cmd.audio_codec("aac").output_arg("-shortest");
        }
        cmd
    }
}

#[async_trait]
impl VideoCodec for FfmpegCodec {
    async fn probe(&self, video: &Path) -> MediaResult<VideoInfo> {
        probe_video(video).await
    }

    async fn extract_frames(&self, video: &Path, frames_dir: &Path) -> MediaResult<Vec<PathBuf>> {
        if !video.exists() {
            return Err(MediaError::FileNotFound(video.to_path_buf()));
        }
        fs::create_dir_all(frames_dir).await?;

        let cmd = FfmpegCommand::new(video, frames_dir.join(FRAME_PATTERN))
            .output_args(["-vsync", "0"]);
        self.runner()
            .run_with_progress(&cmd, |p| {
                if p.frame > 0 {
                    debug!(frame = p.frame, "Extracting frames");
                }
            })
            .await?;

        let frames = list_frames(frames_dir).await?;
        info!(video = %video.display(), frames = frames.len(), "Extracted frames");
        Ok(frames)
    }

    async fn extract_audio(&self, video: &Path, output: &Path) -> MediaResult<()> {
        let cmd = FfmpegCommand::new(video, output)
            .no_video()
            .map("0:a:0")
            .audio_codec("copy");
        self.runner().run(&cmd).await
    }

    async fn encode(
        &self,
        frames_dir: &Path,
        fps: f64,
        audio: Option<&Path>,
        output: &Path,
    ) -> MediaResult<()> {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).await?;
        }
        let cmd = self.encode_command(frames_dir, fps, audio, output);
        self.runner().run(&cmd).await?;
        info!(output = %output.display(), "Encoded video");
        Ok(())
    }
}

/// Frame files in `dir`, sorted by name.
pub async fn list_frames(dir: &Path) -> MediaResult<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut frames = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "png") {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command_with_audio() {
        let codec = FfmpegCodec::new();
        let args = codec
            .encode_command(Path::new("/w/up"), 24.0, Some(Path::new("/w/audio.mka")), Path::new("/w/out.mp4"))
            .build_args();

        assert!(args.contains(&"/w/up/%06d.png".to_string()));
        assert!(args.contains(&"/w/audio.mka".to_string()));
        assert!(args.contains(&"-shortest".to_string()));
        assert!(args.contains(&"yuv420p".to_string()));
    }

    #[test]
    fn test_encode_command_without_audio() {
        let args = FfmpegCodec::new()
            .encode_command(Path::new("/w/up"), 24.0, None, Path::new("/w/out.mp4"))
            .build_args();

        assert!(!args.contains(&"-map".to_string()));
        assert!(!args.contains(&"aac".to_string()));
    }

    #[tokio::test]
    async fn test_list_frames_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["000002.png", "000001.png", "notes.txt", "000010.png"] {
            fs::write(dir.path().join(name), b"x").await.unwrap();
        }

        let frames = list_frames(dir.path()).await.unwrap();
        let names: Vec<_> = frames
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["000001.png", "000002.png", "000010.png"]);
    }
}
