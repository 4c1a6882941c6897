use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use super::{MediaError, MediaProbe, MediaToolkit};
use crate::config::PipelineConfig;
use crate::model::{FrameRef, VideoMetadata};

/// [`MediaToolkit`] backed by the `ffprobe` and `ffmpeg` executables.
#[derive(Debug, Clone)]
pub struct FfmpegToolkit {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    probe_timeout: Duration,
    audio_timeout: Duration,
    frames_timeout: Duration,
    sample_rate: u32,
    channels: u32,
    fps: f64,
    max_frames: usize,
}

impl FfmpegToolkit {
    /// Use `ffmpeg`/`ffprobe` from `FFMPEG_PATH`/`FFPROBE_PATH`, or `PATH`.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let ffmpeg = std::env::var_os("FFMPEG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("ffmpeg"));
        let ffprobe = std::env::var_os("FFPROBE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("ffprobe"));
        Self {
            ffmpeg,
            ffprobe,
            probe_timeout: config.probe_timeout,
            audio_timeout: config.audio_timeout,
            frames_timeout: config.frames_timeout,
            sample_rate: config.audio_sample_rate,
            channels: config.audio_channels,
            fps: config.frame_sampling_fps,
            max_frames: config.max_frames,
        }
    }

    pub fn with_binaries(mut self, ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        self.ffmpeg = ffmpeg.into();
        self.ffprobe = ffprobe.into();
        self
    }

    fn audio_args(&self, video: &Path, output: &Path) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-y".into(),
            "-i".into(),
            video.display().to_string(),
            "-vn".into(),
            "-acodec".into(),
            "pcm_s16le".into(),
            "-ar".into(),
            self.sample_rate.to_string(),
            "-ac".into(),
            self.channels.to_string(),
            output.display().to_string(),
        ]
    }

    fn frame_args(&self, video: &Path, out_dir: &Path) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-y".into(),
            "-i".into(),
            video.display().to_string(),
            "-vf".into(),
            format!("fps={}", self.fps),
            "-frames:v".into(),
            self.max_frames.to_string(),
            "-q:v".into(),
            "2".into(),
            out_dir.join("frame_%05d.jpg").display().to_string(),
        ]
    }
}

#[async_trait]
impl MediaToolkit for FfmpegToolkit {
    async fn probe(&self, video: &Path) -> Result<MediaProbe, MediaError> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(video);
        let stdout = run(cmd, "ffprobe", "probe", self.probe_timeout).await?;
        let mut probe = parse_probe(&stdout)?;
        if probe.metadata.size_bytes == 0 {
            probe.metadata.size_bytes = tokio::fs::metadata(video).await?.len();
        }
        debug!(path = %video.display(), duration = probe.metadata.duration, "probed video");
        Ok(probe)
    }

    async fn extract_audio(&self, video: &Path, output: &Path) -> Result<PathBuf, MediaError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(self.audio_args(video, output));
        run(cmd, "ffmpeg", "audio extraction", self.audio_timeout).await?;
        info!(output = %output.display(), "audio extracted");
        Ok(output.to_path_buf())
    }

    async fn extract_frames(
        &self,
        video: &Path,
        out_dir: &Path,
        metadata: &VideoMetadata,
    ) -> Result<Vec<FrameRef>, MediaError> {
        tokio::fs::create_dir_all(out_dir).await?;
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(self.frame_args(video, out_dir));
        run(cmd, "ffmpeg", "frame extraction", self.frames_timeout).await?;

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(out_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "jpg") {
                files.push(path);
            }
        }
        files.sort();
        let frames = number_frames(files, self.fps, metadata.duration, self.max_frames);
        info!(count = frames.len(), "frames extracted");
        Ok(frames)
    }
}

/// Assign timestamps to frames written by the `fps` filter, in file order.
fn number_frames(files: Vec<PathBuf>, fps: f64, duration: f64, max_frames: usize) -> Vec<FrameRef> {
    let interval = if fps > 0.0 { 1.0 / fps } else { duration.max(1.0) };
    files
        .into_iter()
        .take(max_frames)
        .enumerate()
        .map(|(i, path)| FrameRef {
            timestamp: (i as f64 * interval).min(duration.max(0.0)),
            path,
        })
        .collect()
}

/// Run a command to completion with a wall-clock limit, returning stdout.
///
/// The child is killed if the limit is hit.
async fn run(
    mut cmd: Command,
    tool: &str,
    what: &'static str,
    limit: Duration,
) -> Result<Vec<u8>, MediaError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd.spawn().map_err(|source| MediaError::Spawn {
        tool: tool.to_owned(),
        source,
    })?;

    let output = tokio::time::timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| MediaError::Timeout { what, after: limit })??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        return Err(MediaError::Failed {
            tool: tool.to_owned(),
            status: output.status.to_string(),
            stderr: tail.into_iter().rev().collect::<Vec<_>>().join("\n"),
        });
    }
    Ok(output.stdout)
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    size: Option<String>,
}

fn parse_probe(stdout: &[u8]) -> Result<MediaProbe, MediaError> {
    let parsed: FfprobeOutput = serde_json::from_slice(stdout).map_err(|e| MediaError::Parse {
        tool: "ffprobe".to_owned(),
        message: e.to_string(),
    })?;

    let video = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let has_audio = parsed
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    let duration = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or_else(|| video.and_then(|v| v.duration.as_deref()))
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);
    let size_bytes = parsed
        .format
        .as_ref()
        .and_then(|f| f.size.as_deref())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let metadata = VideoMetadata {
        duration,
        fps: video
            .and_then(|v| v.avg_frame_rate.as_deref().and_then(parse_rate))
            .or_else(|| video.and_then(|v| v.r_frame_rate.as_deref().and_then(parse_rate)))
            .unwrap_or(0.0),
        width: video.and_then(|v| v.width).unwrap_or(0),
        height: video.and_then(|v| v.height).unwrap_or(0),
        size_bytes,
    };

    Ok(MediaProbe {
        metadata,
        has_video: video.is_some(),
        has_audio,
    })
}

/// Parse an ffprobe rational like `30000/1001`.
fn parse_rate(rate: &str) -> Option<f64> {
    let (num, den) = match rate.split_once('/') {
        Some((n, d)) => (n.parse::<f64>().ok()?, d.parse::<f64>().ok()?),
        None => (rate.parse::<f64>().ok()?, 1.0),
    };
    (den != 0.0 && num > 0.0).then(|| num / den)
}
