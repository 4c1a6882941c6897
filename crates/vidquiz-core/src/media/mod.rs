//! Local video handling: validation, probing, audio and frame extraction,
//! scratch cleanup.

pub mod ffmpeg;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::model::{FrameRef, VideoMetadata};

pub use ffmpeg::FfmpegToolkit;

/// Input rejected before any processing stage runs.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("video file not found: {0}")]
    NotFound(PathBuf),

    #[error("video file is not readable: {0}")]
    Unreadable(String),

    #[error("video file too large: {size_mb:.1} MB exceeds the {max_mb} MB limit")]
    TooLarge { size_mb: f64, max_mb: u64 },

    #[error("video too long: {minutes:.1} minutes exceeds the {max_minutes} minute limit")]
    TooLong { minutes: f64, max_minutes: u64 },

    #[error("file contains no video stream")]
    NoVideoStream,

    #[error("malformed URL: {0}")]
    MalformedUrl(String),
}

/// Failure of an external media tool.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("{what} timed out after {}s", .after.as_secs())]
    Timeout { what: &'static str, after: Duration },

    #[error("could not parse {tool} output: {message}")]
    Parse { tool: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of probing a container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaProbe {
    pub metadata: VideoMetadata,
    pub has_video: bool,
    pub has_audio: bool,
}

/// Subprocess-backed media operations. Every call carries its own timeout.
#[async_trait]
pub trait MediaToolkit: Send + Sync {
    async fn probe(&self, video: &Path) -> Result<MediaProbe, MediaError>;

    /// Write a mono 16-bit PCM WAV track suitable for transcription.
    async fn extract_audio(&self, video: &Path, output: &Path) -> Result<PathBuf, MediaError>;

    /// Sample frames into `out_dir`, stopping once `max_frames` is reached.
    async fn extract_frames(
        &self,
        video: &Path,
        out_dir: &Path,
        metadata: &VideoMetadata,
    ) -> Result<Vec<FrameRef>, MediaError>;
}

/// File-level checks: the video exists, is a readable regular file and fits
/// the size limit. Returns the size in bytes.
pub async fn validate_file(path: &Path, config: &PipelineConfig) -> Result<u64, ValidationError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ValidationError::NotFound(path.to_path_buf()));
        }
        Err(e) => return Err(ValidationError::Unreadable(e.to_string())),
    };
    if !meta.is_file() {
        return Err(ValidationError::Unreadable(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    tokio::fs::File::open(path)
        .await
        .map_err(|e| ValidationError::Unreadable(e.to_string()))?;

    let size = meta.len();
    if size > config.max_video_bytes() {
        return Err(ValidationError::TooLarge {
            size_mb: size as f64 / (1024.0 * 1024.0),
            max_mb: config.max_video_size_mb,
        });
    }
    Ok(size)
}

/// Stream and duration checks on a probe result.
pub fn validate_probe(probe: &MediaProbe, config: &PipelineConfig) -> Result<(), ValidationError> {
    if !probe.has_video {
        return Err(ValidationError::NoVideoStream);
    }
    if probe.metadata.duration > config.max_duration_secs() {
        return Err(ValidationError::TooLong {
            minutes: probe.metadata.duration / 60.0,
            max_minutes: config.max_video_duration_minutes,
        });
    }
    Ok(())
}

/// Best-effort removal of files and directories. Failures are logged.
pub async fn remove_paths(paths: &[PathBuf]) {
    for path in paths {
        let result = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
            Ok(_) => tokio::fs::remove_file(path).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!(path = %path.display(), "removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "cleanup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let cfg = PipelineConfig::default();
        let err = validate_file(Path::new("/definitely/not/here.mp4"), &cfg)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::NotFound(_)));
    }

    #[tokio::test]
    async fn oversize_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.mp4");
        tokio::fs::write(&path, vec![0u8; 2 * 1024 * 1024]).await.unwrap();

        let cfg = PipelineConfig {
            max_video_size_mb: 1,
            ..PipelineConfig::default()
        };
        let err = validate_file(&path, &cfg).await.unwrap_err();
        assert!(matches!(err, ValidationError::TooLarge { max_mb: 1, .. }));
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn directory_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate_file(dir.path(), &PipelineConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::Unreadable(_)));
    }

    #[test]
    fn probe_checks_stream_and_duration() {
        let cfg = PipelineConfig::default();
        let mut probe = MediaProbe {
            metadata: VideoMetadata {
                duration: 120.0,
                ..VideoMetadata::default()
            },
            has_video: false,
            has_audio: true,
        };
        assert!(matches!(
            validate_probe(&probe, &cfg),
            Err(ValidationError::NoVideoStream)
        ));

        probe.has_video = true;
        assert!(validate_probe(&probe, &cfg).is_ok());

        probe.metadata.duration = 2.0 * 3600.0;
        assert!(matches!(
            validate_probe(&probe, &cfg),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[tokio::test]
    async fn remove_paths_handles_files_dirs_and_missing() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("a.wav");
        let dir = root.path().join("frames");
        tokio::fs::write(&file, b"x").await.unwrap();
        tokio::fs::create_dir_all(dir.join("nested")).await.unwrap();

        remove_paths(&[file.clone(), dir.clone(), root.path().join("ghost")]).await;
        assert!(!file.exists());
        assert!(!dir.exists());
    }
}
