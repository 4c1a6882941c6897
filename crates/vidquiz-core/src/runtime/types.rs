use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::media::{MediaError, ValidationError};
use crate::source::SourceError;
use crate::stages::StageError;

/// Unique identifier for a submitted task (a UUID v4 string).
pub type TaskId = String;

pub(crate) fn new_task_id() -> TaskId {
    uuid::Uuid::new_v4().to_string()
}

/// Lifecycle state of a task.
///
/// States only move forward in declaration order; `Failed` is reachable from
/// any non-terminal state.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Downloading,
    ExtractingAudio,
    Transcribing,
    AnalyzingFrames,
    GeneratingQuizzes,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// `true` while a run is actively working on the task.
    pub fn is_in_progress(self) -> bool {
        !self.is_terminal() && self != TaskStatus::Pending
    }

    fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Downloading => 1,
            TaskStatus::ExtractingAudio => 2,
            TaskStatus::Transcribing => 3,
            TaskStatus::AnalyzingFrames => 4,
            TaskStatus::GeneratingQuizzes => 5,
            TaskStatus::Completed => 6,
            TaskStatus::Failed => 7,
        }
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// Staying in the same state is allowed so progress can advance within a
    /// stage.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == TaskStatus::Failed || next.rank() >= self.rank()
    }
}

/// Fine-grained label of the step a run is currently executing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProcessingStage {
    Download,
    Validation,
    MetadataProbe,
    AudioExtraction,
    Transcription,
    FrameExtraction,
    FrameAnalysis,
    Segmentation,
    QuizGeneration,
    TitleGeneration,
    Finalization,
}

impl ProcessingStage {
    /// The task status a run reports while executing this step.
    pub fn status(self) -> TaskStatus {
        match self {
            ProcessingStage::Download => TaskStatus::Downloading,
            ProcessingStage::Validation
            | ProcessingStage::MetadataProbe
            | ProcessingStage::AudioExtraction => TaskStatus::ExtractingAudio,
            ProcessingStage::Transcription => TaskStatus::Transcribing,
            ProcessingStage::FrameExtraction | ProcessingStage::FrameAnalysis => {
                TaskStatus::AnalyzingFrames
            }
            ProcessingStage::Segmentation
            | ProcessingStage::QuizGeneration
            | ProcessingStage::TitleGeneration
            | ProcessingStage::Finalization => TaskStatus::GeneratingQuizzes,
        }
    }
}

/// Errors returned by the orchestrator's public API.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("submission queue is full")]
    QueueFull,

    #[error("task {task_id} not found")]
    TaskNotFound { task_id: TaskId },

    #[error("task {task_id} already has an active run")]
    AlreadyRunning { task_id: TaskId },

    #[error("task {task_id} is {status}, expected pending")]
    NotPending { task_id: TaskId, status: TaskStatus },

    #[error("orchestrator is shut down")]
    Shutdown,
}

/// An unrecoverable failure of a single run. Its message becomes the task's
/// `error` field.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{stage} failed: {source}")]
    Stage {
        stage: ProcessingStage,
        #[source]
        source: StageError,
    },

    #[error("{stage} failed: {source}")]
    Media {
        stage: ProcessingStage,
        #[source]
        source: MediaError,
    },

    #[error("download failed: {0}")]
    Source(#[from] SourceError),

    /// The task left the registry while the run was still going.
    #[error("task was removed")]
    Deleted,
}

impl PipelineError {
    pub fn stage(stage: ProcessingStage, source: StageError) -> Self {
        PipelineError::Stage { stage, source }
    }

    pub fn media(stage: ProcessingStage, source: MediaError) -> Self {
        PipelineError::Media { stage, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_moves_forward_only() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::ExtractingAudio));
        assert!(TaskStatus::Transcribing.can_transition_to(TaskStatus::Transcribing));
        assert!(!TaskStatus::AnalyzingFrames.can_transition_to(TaskStatus::Transcribing));
        assert!(TaskStatus::Downloading.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn status_string_forms_agree() {
        assert_eq!(TaskStatus::ExtractingAudio.to_string(), "extracting_audio");
        assert_eq!(
            serde_json::to_value(TaskStatus::GeneratingQuizzes).unwrap(),
            "generating_quizzes"
        );
        assert_eq!(
            "analyzing_frames".parse::<TaskStatus>().unwrap(),
            TaskStatus::AnalyzingFrames
        );
    }

    #[test]
    fn validation_maps_to_extracting_audio() {
        assert_eq!(ProcessingStage::Validation.status(), TaskStatus::ExtractingAudio);
        assert_eq!(ProcessingStage::Download.status(), TaskStatus::Downloading);
    }
}
