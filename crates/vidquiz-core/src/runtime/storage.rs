use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;

use crate::model::{FrameAnalysis, Segment, TranscriptSpan, VideoMetadata};
use crate::runtime::types::{new_task_id, ProcessingStage, TaskId, TaskStatus};

/// Where a task's video comes from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskSource {
    /// A file already written to local disk by the upload handler.
    Upload { path: PathBuf },
    /// A remote URL fetched by the download step.
    Url { url: String },
}

/// Point-in-time copy of a task record.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// `None` until the first stage reports progress.
    pub progress: Option<f64>,
    pub current_stage: Option<ProcessingStage>,
    pub error: Option<String>,
    pub language: String,
    pub source: TaskSource,
    pub video_path: Option<PathBuf>,
    pub audio_path: Option<PathBuf>,
    /// Task-scoped scratch directory holding downloads, audio and frames.
    pub work_dir: Option<PathBuf>,
    pub metadata: Option<VideoMetadata>,
    pub transcription: Vec<TranscriptSpan>,
    pub frame_analyses: Vec<FrameAnalysis>,
    /// `Some` only once the task is `Completed`.
    pub segments: Option<Vec<Segment>>,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskSnapshot {
    fn new(task_id: TaskId, source: TaskSource, language: String) -> Self {
        let now = Utc::now();
        let video_path = match &source {
            TaskSource::Upload { path } => Some(path.clone()),
            TaskSource::Url { .. } => None,
        };
        Self {
            task_id,
            status: TaskStatus::Pending,
            progress: None,
            current_stage: None,
            error: None,
            language,
            source,
            video_path,
            audio_path: None,
            work_dir: None,
            metadata: None,
            transcription: Vec::new(),
            frame_analyses: Vec::new(),
            segments: None,
            title: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Local files owned by this task that cleanup may delete.
    pub fn scratch_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        paths.extend(self.video_path.clone());
        paths.extend(self.audio_path.clone());
        paths.extend(self.work_dir.clone());
        paths
    }
}

/// Partial update applied atomically by [`TaskRegistry::update`].
///
/// Unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<f64>,
    pub current_stage: Option<ProcessingStage>,
    pub error: Option<String>,
    pub video_path: Option<PathBuf>,
    pub audio_path: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub metadata: Option<VideoMetadata>,
    pub transcription: Option<Vec<TranscriptSpan>>,
    pub frame_analyses: Option<Vec<FrameAnalysis>>,
    pub segments: Option<Vec<Segment>>,
    pub title: Option<String>,
}

impl TaskPatch {
    /// Enter (or advance within) `stage` at the given progress checkpoint.
    pub fn stage(stage: ProcessingStage, progress: f64) -> Self {
        Self {
            status: Some(stage.status()),
            current_stage: Some(stage),
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn completed(segments: Vec<Segment>, title: String) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            progress: Some(100.0),
            segments: Some(segments),
            title: Some(title),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_video_path(mut self, path: PathBuf) -> Self {
        self.video_path = Some(path);
        self
    }

    pub fn with_audio_path(mut self, path: PathBuf) -> Self {
        self.audio_path = Some(path);
        self
    }

    pub fn with_work_dir(mut self, dir: PathBuf) -> Self {
        self.work_dir = Some(dir);
        self
    }

    pub fn with_metadata(mut self, metadata: VideoMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_transcription(mut self, spans: Vec<TranscriptSpan>) -> Self {
        self.transcription = Some(spans);
        self
    }

    pub fn with_frame_analyses(mut self, analyses: Vec<FrameAnalysis>) -> Self {
        self.frame_analyses = Some(analyses);
        self
    }
}

/// Progress fields as they stand right after an update was applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressView {
    pub status: TaskStatus,
    pub progress: f64,
    pub current_stage: Option<ProcessingStage>,
}

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<TaskId, TaskSnapshot>,
    /// `(url, language)` → task that owns that source.
    sources: HashMap<(String, String), TaskId>,
}

/// In-memory registry of task records.
///
/// A `tokio::sync::RwLock<HashMap>` lets status readers run concurrently with
/// the single orchestrator run that writes a given task.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new `Pending` task and return its identifier.
    pub async fn create(&self, source: TaskSource, language: impl Into<String>) -> TaskId {
        let task_id = new_task_id();
        let snapshot = TaskSnapshot::new(task_id.clone(), source, language.into());
        self.inner.write().await.tasks.insert(task_id.clone(), snapshot);
        task_id
    }

    /// Create a URL-sourced task unless one already exists for the same
    /// `(url, language)` key.
    ///
    /// Returns the task identifier and whether an existing task was reused.
    /// Failed or evicted tasks are replaced by a fresh one.
    pub async fn create_or_reuse(&self, url: &str, language: &str) -> (TaskId, bool) {
        let key = (url.to_owned(), language.to_owned());
        let mut guard = self.inner.write().await;

        let live = guard
            .sources
            .get(&key)
            .filter(|id| {
                guard
                    .tasks
                    .get(*id)
                    .is_some_and(|t| t.status != TaskStatus::Failed)
            })
            .cloned();
        if let Some(existing) = live {
            return (existing, true);
        }

        let task_id = new_task_id();
        let snapshot = TaskSnapshot::new(
            task_id.clone(),
            TaskSource::Url {
                url: url.to_owned(),
            },
            language.to_owned(),
        );
        guard.tasks.insert(task_id.clone(), snapshot);
        guard.sources.insert(key, task_id.clone());
        (task_id, false)
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.inner.read().await.tasks.get(task_id).cloned()
    }

    pub async fn contains(&self, task_id: &str) -> bool {
        self.inner.read().await.tasks.contains_key(task_id)
    }

    pub async fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.inner.read().await.tasks.get(task_id).map(|t| t.status)
    }

    /// Apply `patch` to a task in one step.
    ///
    /// Returns `None` when the task no longer exists or the patch would move
    /// the task backwards; callers treat both as a no-op.
    pub async fn update(&self, task_id: &str, patch: TaskPatch) -> Option<ProgressView> {
        let mut guard = self.inner.write().await;
        let task = guard.tasks.get_mut(task_id)?;
        apply_patch(task, patch)
    }

    /// Remove a task. Subsequent `get` calls return `None`.
    pub async fn remove(&self, task_id: &str) -> Option<TaskSnapshot> {
        let mut guard = self.inner.write().await;
        let removed = guard.tasks.remove(task_id)?;
        guard.sources.retain(|_, id| id != task_id);
        Some(removed)
    }

    /// Remove every terminal task last updated more than `max_age` ago.
    pub async fn sweep(&self, max_age: Duration) -> Vec<TaskSnapshot> {
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut guard = self.inner.write().await;
        let expired: Vec<TaskId> = guard
            .tasks
            .values()
            .filter(|t| t.status.is_terminal() && t.updated_at <= cutoff)
            .map(|t| t.task_id.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for task_id in expired {
            if let Some(task) = guard.tasks.remove(&task_id) {
                removed.push(task);
            }
        }
        guard
            .sources
            .retain(|_, id| removed.iter().all(|t| &t.task_id != id));
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.tasks.is_empty()
    }
}

fn apply_patch(task: &mut TaskSnapshot, patch: TaskPatch) -> Option<ProgressView> {
    if task.status.is_terminal() {
        // Terminal records are owned by the durable projection now.
        return None;
    }
    let status = patch.status.unwrap_or(task.status);
    if !task.status.can_transition_to(status) {
        warn!(
            task_id = %task.task_id,
            from = %task.status,
            to = %status,
            "rejected backward status transition"
        );
        return None;
    }
    task.status = status;

    if let Some(p) = patch.progress {
        let p = p.clamp(0.0, 100.0);
        task.progress = Some(task.progress.map_or(p, |old| old.max(p)));
    }
    if let Some(path) = patch.video_path {
        task.video_path = Some(path);
    }
    if let Some(path) = patch.audio_path {
        task.audio_path = Some(path);
    }
    if let Some(dir) = patch.work_dir {
        task.work_dir = Some(dir);
    }
    if let Some(metadata) = patch.metadata {
        task.metadata = Some(metadata);
    }
    if let Some(spans) = patch.transcription {
        task.transcription = spans;
    }
    if let Some(analyses) = patch.frame_analyses {
        task.frame_analyses = analyses;
    }
    if let Some(title) = patch.title {
        task.title = Some(title);
    }

    match status {
        TaskStatus::Completed => {
            task.progress = Some(100.0);
            task.current_stage = None;
            task.error = None;
            task.segments = Some(patch.segments.unwrap_or_default());
        }
        TaskStatus::Failed => {
            task.current_stage = None;
            task.segments = None;
            task.error = Some(
                patch
                    .error
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| "unknown error".to_owned()),
            );
        }
        TaskStatus::Pending => {
            task.current_stage = None;
        }
        _ => {
            if let Some(stage) = patch.current_stage {
                task.current_stage = Some(stage);
            }
        }
    }

    task.updated_at = Utc::now();
    Some(ProgressView {
        status: task.status,
        progress: task.progress.unwrap_or(0.0),
        current_stage: task.current_stage,
    })
}
