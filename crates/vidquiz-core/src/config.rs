//! Pipeline tuning knobs.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::runtime::governor::HardwareProfile;

/// Limits, sampling rates and timeouts used by a pipeline run.
///
/// Every field has a default so `PipelineConfig::default()` is a usable
/// configuration on its own.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root of the per-task scratch directories.
    pub temp_dir: PathBuf,
    pub max_video_size_mb: u64,
    pub max_video_duration_minutes: u64,

    /// Frames sampled per second of video.
    pub frame_sampling_fps: f64,
    /// Hard cap on extracted frames; extraction stops once reached.
    pub max_frames: usize,
    /// Frames per analyzer call. Values below 1 are treated as 1.
    pub frame_batch_size: usize,

    pub audio_sample_rate: u32,
    pub audio_channels: u32,

    pub hardware_profile: HardwareProfile,

    #[serde(with = "secs")]
    pub probe_timeout: Duration,
    #[serde(with = "secs")]
    pub audio_timeout: Duration,
    #[serde(with = "secs")]
    pub frames_timeout: Duration,
    #[serde(with = "secs")]
    pub download_timeout: Duration,
    #[serde(with = "secs")]
    pub store_timeout: Duration,

    /// Terminal tasks older than this are swept from memory.
    #[serde(with = "secs")]
    pub task_retention: Duration,
    #[serde(with = "secs")]
    pub sweep_interval: Duration,

    pub queue_capacity: usize,
    pub max_concurrent_tasks: usize,

    pub title_fallback_words: usize,
    pub title_max_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("./temp"),
            max_video_size_mb: 500,
            max_video_duration_minutes: 60,
            frame_sampling_fps: 0.1,
            max_frames: 100,
            frame_batch_size: 1,
            audio_sample_rate: 16_000,
            audio_channels: 1,
            hardware_profile: HardwareProfile::Constrained,
            probe_timeout: Duration::from_secs(60),
            audio_timeout: Duration::from_secs(600),
            frames_timeout: Duration::from_secs(600),
            download_timeout: Duration::from_secs(1800),
            store_timeout: Duration::from_secs(10),
            task_retention: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(600),
            queue_capacity: 64,
            max_concurrent_tasks: 4,
            title_fallback_words: 8,
            title_max_chars: 80,
        }
    }
}

impl PipelineConfig {
    pub fn max_video_bytes(&self) -> u64 {
        self.max_video_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn max_duration_secs(&self) -> f64 {
        (self.max_video_duration_minutes * 60) as f64
    }

    pub fn batch_size(&self) -> usize {
        self.frame_batch_size.max(1)
    }

    /// Scratch directory dedicated to one task.
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.temp_dir.join(task_id)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
