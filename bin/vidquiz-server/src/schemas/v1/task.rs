use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use vidquiz_core::model::{Segment, VideoMetadata};
use vidquiz_core::store::StoredTask;
use vidquiz_core::{TaskSnapshot, TaskSource};

/// Quiz languages a task can be created for.
pub const SUPPORTED_LANGUAGES: [&str; 3] = ["en", "ru", "kk"];
pub const DEFAULT_LANGUAGE: &str = "en";

/// Resolve an optional language field, rejecting unsupported codes.
pub fn resolve_language(raw: Option<&str>) -> Result<String, String> {
    let language = raw
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .unwrap_or(DEFAULT_LANGUAGE)
        .to_ascii_lowercase();
    if SUPPORTED_LANGUAGES.contains(&language.as_str()) {
        Ok(language)
    } else {
        Err(format!(
            "unsupported language {language:?}, expected one of {}",
            SUPPORTED_LANGUAGES.join(", ")
        ))
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UrlTaskRequest {
    /// Direct video link or a hosted video page (YouTube and similar).
    pub url: String,
    /// Quiz language: `en`, `ru` or `kk`. Defaults to `en`.
    pub language: Option<String>,
}

/// Multipart body of `POST /v1/tasks/upload`.
#[derive(Debug, ToSchema)]
#[allow(dead_code)]
pub struct UploadForm {
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
    pub language: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SubmitResponse {
    pub task_id: String,
    pub status: String,
    /// `true` when an existing task for the same URL and language was
    /// returned.
    pub reused: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TaskResponse {
    pub task_id: String,
    pub status: String,
    pub progress: f64,
    pub current_stage: Option<String>,
    pub error: Option<String>,
    pub language: String,
    pub source_url: Option<String>,
    pub title: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<VideoMetadata>,
    pub total_segments: Option<usize>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SegmentsResponse {
    pub task_id: String,
    pub title: Option<String>,
    pub duration: Option<f64>,
    #[schema(value_type = Vec<Object>)]
    pub segments: Vec<Segment>,
}

impl TaskResponse {
    pub fn from_snapshot(task: &TaskSnapshot) -> Self {
        let source_url = match &task.source {
            TaskSource::Url { url } => Some(url.clone()),
            TaskSource::Upload { .. } => None,
        };
        Self {
            task_id: task.task_id.clone(),
            status: task.status.to_string(),
            progress: task.progress.unwrap_or(0.0),
            current_stage: task.current_stage.map(|s| s.to_string()),
            error: task.error.clone(),
            language: task.language.clone(),
            source_url,
            title: task.title.clone(),
            metadata: task.metadata.clone(),
            total_segments: task.segments.as_ref().map(Vec::len),
            created_at: task.created_at.to_rfc3339(),
            updated_at: task.updated_at.to_rfc3339(),
        }
    }

    pub fn from_stored(task: StoredTask) -> Self {
        Self {
            total_segments: task.segments.as_ref().map(Vec::len),
            task_id: task.task_id,
            status: task.status.to_string(),
            progress: task.progress,
            current_stage: task.current_stage,
            error: task.error,
            language: task.language,
            source_url: task.source_url,
            title: task.title,
            metadata: task.metadata,
            created_at: task.created_at.to_rfc3339(),
            updated_at: task.updated_at.to_rfc3339(),
        }
    }
}
