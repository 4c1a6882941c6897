//! Task endpoints: submit by upload or URL, poll status, fetch results,
//! delete, and the live event stream.
//!
//! Status reads go to the orchestrator's in-memory registry first and fall
//! back to the durable store for tasks that have been swept from memory.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{info, warn};
use utoipa::OpenApi;
use uuid::Uuid;
use vidquiz_core::store::DurableStore;
use vidquiz_core::{Submission, TaskRequest, TaskStatus, source};

use crate::error::ServerError;
use crate::routes::v1::ws;
use crate::schemas::v1::task::{
    SegmentsResponse, SubmitResponse, TaskResponse, UploadForm, UrlTaskRequest, resolve_language,
};
use crate::state::AppState;

/// Container extensions accepted by the upload endpoint.
const VIDEO_EXTENSIONS: [&str; 6] = ["mp4", "avi", "mov", "mkv", "webm", "flv"];

#[derive(OpenApi)]
#[openapi(
    paths(upload_video, submit_url, get_task, get_segments, delete_task, ws::task_events),
    components(schemas(UploadForm, UrlTaskRequest, SubmitResponse, TaskResponse, SegmentsResponse))
)]
pub struct TasksApi;

pub fn router(upload_limit: usize) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/tasks/upload",
            post(upload_video).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/tasks/url", post(submit_url))
        .route("/tasks/{id}", get(get_task).delete(delete_task))
        .route("/tasks/{id}/segments", get(get_segments))
        .route("/tasks/{id}/ws", get(ws::task_events))
}

#[utoipa::path(
    post,
    path = "/v1/tasks/upload",
    tag = "tasks",
    request_body(content = UploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 202, description = "Task created and queued", body = SubmitResponse),
        (status = 400, description = "Missing file, bad type or language"),
        (status = 413, description = "Video exceeds the size limit"),
        (status = 503, description = "Submission queue is full"),
    )
)]
pub async fn upload_video(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ServerError> {
    let mut saved: Option<PathBuf> = None;
    let mut language: Option<String> = None;

    let read = async {
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ServerError::BadRequest(e.to_string()))?
        {
            let name = field.name().map(str::to_owned);
            match name.as_deref() {
                Some("file") => {
                    if saved.is_some() {
                        return Err(ServerError::BadRequest("only one file per task".into()));
                    }
                    let extension = video_extension(field.file_name())?;
                    let dest = state
                        .config
                        .upload_dir()
                        .join(format!("{}.{extension}", Uuid::new_v4()));
                    let max_bytes = state.config.pipeline.max_video_bytes();
                    let written = source::save_upload(Box::pin(field), &dest, max_bytes).await?;
                    info!(path = %dest.display(), bytes = written, "upload stored");
                    saved = Some(dest);
                }
                Some("language") => {
                    let text = field
                        .text()
                        .await
                        .map_err(|e| ServerError::BadRequest(e.to_string()))?;
                    language = Some(text);
                }
                _ => {}
            }
        }
        Ok(())
    }
    .await;

    let outcome = read.and_then(|()| {
        let path = saved
            .clone()
            .ok_or_else(|| ServerError::BadRequest("multipart field `file` is required".into()))?;
        let language = resolve_language(language.as_deref()).map_err(ServerError::BadRequest)?;
        Ok((path, language))
    });
    let (path, language) = match outcome {
        Ok(parts) => parts,
        Err(e) => {
            discard(saved.as_deref()).await;
            return Err(e);
        }
    };

    let submission = match state
        .orchestrator
        .submit(TaskRequest::upload(&path, language))
        .await
    {
        Ok(submission) => submission,
        Err(e) => {
            discard(Some(&path)).await;
            return Err(e.into());
        }
    };
    Ok((StatusCode::ACCEPTED, Json(submit_response(&state, submission).await)))
}

#[utoipa::path(
    post,
    path = "/v1/tasks/url",
    tag = "tasks",
    request_body = UrlTaskRequest,
    responses(
        (status = 202, description = "Task created, or an existing one reused", body = SubmitResponse),
        (status = 400, description = "Malformed URL or unsupported language"),
        (status = 503, description = "Submission queue is full"),
    )
)]
pub async fn submit_url(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UrlTaskRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ServerError> {
    let language = resolve_language(req.language.as_deref()).map_err(ServerError::BadRequest)?;
    let url = source::normalize_url(&req.url).map_err(|e| ServerError::BadRequest(e.to_string()))?;

    let submission = state
        .orchestrator
        .submit(TaskRequest::url(url, language))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(submit_response(&state, submission).await)))
}

#[utoipa::path(
    get,
    path = "/v1/tasks/{id}",
    tag = "tasks",
    params(("id" = String, Path, description = "Task identifier")),
    responses(
        (status = 200, description = "Task status", body = TaskResponse),
        (status = 404, description = "Task not found"),
    )
)]
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ServerError> {
    if let Some(task) = state.orchestrator.status(&id).await {
        return Ok(Json(TaskResponse::from_snapshot(&task)));
    }
    let stored = state
        .store
        .load_task(&id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("task {id} not found")))?;
    Ok(Json(TaskResponse::from_stored(stored)))
}

#[utoipa::path(
    get,
    path = "/v1/tasks/{id}/segments",
    tag = "tasks",
    params(("id" = String, Path, description = "Task identifier")),
    responses(
        (status = 200, description = "Segments with quizzes", body = SegmentsResponse),
        (status = 404, description = "Task not found"),
        (status = 409, description = "Task has not completed"),
    )
)]
pub async fn get_segments(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SegmentsResponse>, ServerError> {
    let (status, title, duration, segments) = match state.orchestrator.status(&id).await {
        Some(task) => (
            task.status,
            task.title,
            task.metadata.map(|m| m.duration),
            task.segments,
        ),
        None => {
            let stored = state
                .store
                .load_task(&id)
                .await?
                .ok_or_else(|| ServerError::NotFound(format!("task {id} not found")))?;
            (
                stored.status,
                stored.title,
                stored.metadata.map(|m| m.duration),
                stored.segments,
            )
        }
    };

    if status != TaskStatus::Completed {
        return Err(ServerError::Conflict(format!("task {id} is {status}")));
    }
    Ok(Json(SegmentsResponse {
        task_id: id,
        title,
        duration,
        segments: segments.unwrap_or_default(),
    }))
}

#[utoipa::path(
    delete,
    path = "/v1/tasks/{id}",
    tag = "tasks",
    params(("id" = String, Path, description = "Task identifier")),
    responses(
        (status = 204, description = "Task deleted"),
        (status = 404, description = "Task not found"),
    )
)]
pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ServerError> {
    let in_memory = state.orchestrator.delete(&id).await;
    let in_store = state.store.delete_task(&id).await?;
    if !in_memory && !in_store {
        return Err(ServerError::NotFound(format!("task {id} not found")));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn submit_response(state: &AppState, submission: Submission) -> SubmitResponse {
    let status = state
        .orchestrator
        .status(&submission.task_id)
        .await
        .map_or(TaskStatus::Pending, |t| t.status);
    SubmitResponse {
        task_id: submission.task_id,
        status: status.to_string(),
        reused: submission.reused,
    }
}

fn video_extension(file_name: Option<&str>) -> Result<String, ServerError> {
    let extension = file_name
        .and_then(|name| FsPath::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if VIDEO_EXTENSIONS.contains(&extension.as_str()) {
        Ok(extension)
    } else {
        Err(ServerError::BadRequest(format!(
            "unsupported file type {extension:?}, expected one of {}",
            VIDEO_EXTENSIONS.join(", ")
        )))
    }
}

async fn discard(path: Option<&FsPath>) {
    let Some(path) = path else { return };
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "failed to remove rejected upload");
    }
}
