//! Stage-function contracts.
//!
//! Each model-bearing stage owns one heavyweight resource (a loaded model or
//! a warmed-up remote session) behind [`ModelStage`]. The orchestrator never
//! calls `load`/`unload` itself; the resource governor does, around every
//! invocation. All methods are blocking and run on the blocking thread pool.

pub mod fallback;
pub mod remote;

use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::model::{FrameAnalysis, FrameRef, Quiz, SegmentProposal, TranscriptSpan};

/// Errors raised by a stage function.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("model load failed: {0}")]
    Load(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid model output: {0}")]
    InvalidOutput(String),

    #[error("stage unavailable: {0}")]
    Unavailable(String),
}

/// Lifecycle of the heavyweight resource behind a stage.
pub trait ModelStage: Send + Sync + 'static {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Load the model. Idempotent.
    fn load(&self) -> Result<(), StageError>;

    /// Release the model and its accelerator memory. Idempotent and safe to
    /// call when nothing is loaded.
    fn unload(&self) -> Result<(), StageError>;

    fn is_loaded(&self) -> bool;
}

/// Speech-to-text over a mono PCM WAV file.
pub trait Transcriber: ModelStage {
    fn transcribe(&self, audio: &Path) -> Result<Vec<TranscriptSpan>, StageError>;
}

/// Captions a batch of sampled frames.
pub trait FrameAnalyzer: ModelStage {
    fn analyze(&self, frames: &[FrameRef]) -> Result<Vec<FrameAnalysis>, StageError>;
}

/// Proposes topic segments and writes quiz items for them.
pub trait QuizGenerator: ModelStage {
    fn propose_segments(
        &self,
        transcript: &[TranscriptSpan],
        frames: &[FrameAnalysis],
        duration: f64,
    ) -> Result<Vec<SegmentProposal>, StageError>;

    fn generate_quizzes(
        &self,
        segment: &SegmentProposal,
        transcript: &[TranscriptSpan],
        frames: &[FrameAnalysis],
        language: &str,
    ) -> Result<Vec<Quiz>, StageError>;
}

/// Produces a short human-readable title for the whole video.
pub trait TitleGenerator: ModelStage {
    fn generate_title(
        &self,
        transcript: &[TranscriptSpan],
        frames: &[FrameAnalysis],
        duration: f64,
    ) -> Result<String, StageError>;
}
