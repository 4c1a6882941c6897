//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

use vidquiz_core::{HardwareProfile, PipelineConfig};

/// Runtime configuration for vidquiz-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8000"`).
    pub bind_address: String,

    /// SQLite database URL (default: `"sqlite://vidquiz.db"`).
    pub database_url: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,sqlx=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Comma-separated list of allowed CORS origins. `None` allows any.
    pub cors_allowed_origins: Option<String>,

    /// Directory finished videos are copied to. Unset keeps them in place.
    pub archive_dir: Option<PathBuf>,

    /// Base URL of the OpenAI-compatible transcription server.
    pub transcribe_url: String,
    pub transcribe_model: String,
    /// Spoken language hint for transcription. Unset lets the server detect it.
    pub transcribe_language: Option<String>,

    /// Base URL of the Ollama server used for vision and text generation.
    pub ollama_url: String,
    pub vision_model: String,
    pub llm_model: String,
    pub quizzes_per_segment: usize,

    /// Per-request ceiling for inference HTTP calls.
    pub inference_timeout: Duration,

    /// Pipeline limits, sampling and task lifecycle knobs.
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build [`Config`] from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = Env { lookup: &lookup };
        let defaults = PipelineConfig::default();

        let pipeline = PipelineConfig {
            temp_dir: PathBuf::from(env.or("VIDQUIZ_TEMP_DIR", "./temp")),
            max_video_size_mb: env.parse("VIDQUIZ_MAX_VIDEO_SIZE_MB", defaults.max_video_size_mb),
            max_video_duration_minutes: env.parse(
                "VIDQUIZ_MAX_VIDEO_DURATION_MINUTES",
                defaults.max_video_duration_minutes,
            ),
            frame_sampling_fps: env.parse("VIDQUIZ_FRAME_SAMPLING_FPS", defaults.frame_sampling_fps),
            max_frames: env.parse("VIDQUIZ_MAX_FRAMES", defaults.max_frames),
            frame_batch_size: env.parse("VIDQUIZ_FRAME_BATCH_SIZE", defaults.frame_batch_size),
            hardware_profile: env.parse::<HardwareProfile>(
                "VIDQUIZ_HARDWARE_PROFILE",
                defaults.hardware_profile,
            ),
            download_timeout: env.secs("VIDQUIZ_DOWNLOAD_TIMEOUT_SECS", defaults.download_timeout),
            task_retention: env.secs("VIDQUIZ_TASK_RETENTION_SECS", defaults.task_retention),
            sweep_interval: env.secs("VIDQUIZ_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            queue_capacity: env.parse("VIDQUIZ_QUEUE_CAPACITY", defaults.queue_capacity),
            max_concurrent_tasks: env.parse(
                "VIDQUIZ_MAX_CONCURRENT_TASKS",
                defaults.max_concurrent_tasks,
            ),
            ..defaults
        };

        Self {
            bind_address: env.or("VIDQUIZ_BIND", "0.0.0.0:8000"),
            database_url: env.or("VIDQUIZ_DATABASE_URL", "sqlite://vidquiz.db"),
            log_level: env.or("VIDQUIZ_LOG", "info"),
            log_json: env
                .get("VIDQUIZ_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            cors_allowed_origins: env.get("VIDQUIZ_CORS_ORIGINS").filter(|v| !v.trim().is_empty()),
            archive_dir: env
                .get("VIDQUIZ_ARCHIVE_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            transcribe_url: env.or("VIDQUIZ_TRANSCRIBE_URL", "http://127.0.0.1:8080"),
            transcribe_model: env.or("VIDQUIZ_TRANSCRIBE_MODEL", "whisper-1"),
            transcribe_language: env
                .get("VIDQUIZ_TRANSCRIBE_LANGUAGE")
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty()),
            ollama_url: env.or("VIDQUIZ_OLLAMA_URL", "http://127.0.0.1:11434"),
            vision_model: env.or("VIDQUIZ_VISION_MODEL", "llava"),
            llm_model: env.or("VIDQUIZ_LLM_MODEL", "qwen2.5:7b"),
            quizzes_per_segment: env.parse("VIDQUIZ_QUIZZES_PER_SEGMENT", 2),
            inference_timeout: env.secs("VIDQUIZ_INFERENCE_TIMEOUT_SECS", Duration::from_secs(600)),
            pipeline,
        }
    }

    /// Where multipart uploads are written before a task takes them over.
    pub fn upload_dir(&self) -> PathBuf {
        self.pipeline.temp_dir.join("uploads")
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_owned())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}
