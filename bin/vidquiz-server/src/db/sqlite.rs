//! SQLite implementation of [`DurableStore`].
//!
//! Migrations are run automatically on startup via [`SqliteStore::connect`].
//! `sqlx::migrate!("./migrations")` resolves the path at compile time
//! relative to the crate root, so the SQL is embedded into the binary.
//!
//! Queries use the runtime-checked `sqlx::query` form so no `DATABASE_URL`
//! is needed at compile time. Timestamps are stored as RFC 3339 strings,
//! segments and metadata as JSON text.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use vidquiz_core::model::{Segment, VideoMetadata};
use vidquiz_core::runtime::types::ProcessingStage;
use vidquiz_core::store::{DurableStore, StoreError, StoredTask};
use vidquiz_core::{TaskSnapshot, TaskSource, TaskStatus};

/// Error recorded on tasks that were mid-run when the server stopped.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

type TaskRow = (
    String,
    String,
    f64,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
);

/// SQLite-backed task store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending
    /// migrations.
    ///
    /// `url` is a sqlx SQLite URL such as `"sqlite://vidquiz.db"` or
    /// `"sqlite::memory:"`. An in-memory database is held on a single
    /// connection so every query sees the migrated schema.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let max_connections = if url.contains(":memory:") { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Mark every row left in a non-terminal status as failed.
    ///
    /// Called once at startup: a run never survives a restart, so those
    /// rows would otherwise report progress forever.
    pub async fn interrupt_running_tasks(&self) -> Result<u64, sqlx::Error> {
        let updated_at = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE tasks SET status = ?1, error_msg = ?2, current_stage = NULL, updated_at = ?3 \
             WHERE status NOT IN (?4, ?5)",
        )
        .bind(TaskStatus::Failed.as_ref())
        .bind(INTERRUPTED_MESSAGE)
        .bind(&updated_at)
        .bind(TaskStatus::Completed.as_ref())
        .bind(TaskStatus::Failed.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete a task row. Returns `true` if a row was removed.
    pub async fn delete_task(&self, task_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn persist_created(&self, task: &TaskSnapshot) -> Result<(), StoreError> {
        let (source_url, video_location) = match &task.source {
            TaskSource::Url { url } => (Some(url.clone()), None),
            TaskSource::Upload { path } => (None, Some(path.to_string_lossy().into_owned())),
        };
        sqlx::query(
            "INSERT INTO tasks (id, status, progress, language, source_url, video_location, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&task.task_id)
        .bind(task.status.as_ref())
        .bind(task.progress.unwrap_or(0.0))
        .bind(&task.language)
        .bind(source_url)
        .bind(video_location)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn persist_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        progress: f64,
        stage: Option<ProcessingStage>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE tasks SET status = ?1, progress = ?2, current_stage = ?3, error_msg = ?4, updated_at = ?5 \
             WHERE id = ?6",
        )
        .bind(status.as_ref())
        .bind(progress)
        .bind(stage.map(|s| s.to_string()))
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn persist_video_location(&self, task_id: &str, location: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE tasks SET video_location = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(location)
            .bind(Utc::now().to_rfc3339())
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn persist_results(
        &self,
        task_id: &str,
        segments: &[Segment],
        metadata: &VideoMetadata,
        title: &str,
    ) -> Result<(), StoreError> {
        let segments = serde_json::to_string(segments)?;
        let metadata = serde_json::to_string(metadata)?;
        sqlx::query(
            "UPDATE tasks SET segments = ?1, metadata = ?2, title = ?3, updated_at = ?4 WHERE id = ?5",
        )
        .bind(segments)
        .bind(metadata)
        .bind(title)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn load_task(&self, task_id: &str) -> Result<Option<StoredTask>, StoreError> {
        let row: Option<TaskRow> = sqlx::query_as(
            "SELECT id, status, progress, current_stage, error_msg, language, source_url, \
                    video_location, title, metadata, segments, created_at, updated_at \
             FROM tasks WHERE id = ?1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let Some((
            id,
            status,
            progress,
            current_stage,
            error,
            language,
            source_url,
            video_location,
            title,
            metadata,
            segments,
            created_at,
            updated_at,
        )) = row
        else {
            return Ok(None);
        };

        let status = status
            .parse::<TaskStatus>()
            .map_err(|_| StoreError::Backend(format!("unknown task status {status:?}")))?;
        let metadata = metadata
            .map(|m| serde_json::from_str::<VideoMetadata>(&m))
            .transpose()?;
        let segments = segments
            .map(|s| serde_json::from_str::<Vec<Segment>>(&s))
            .transpose()?;

        Ok(Some(StoredTask {
            task_id: id,
            status,
            progress,
            current_stage,
            error,
            language,
            source_url,
            video_location,
            title,
            metadata,
            segments,
            created_at: parse_time(&created_at),
            updated_at: parse_time(&updated_at),
        }))
    }
}

#[cfg(test)]
mod tests {
    use vidquiz_core::model::Quiz;
    use vidquiz_core::runtime::storage::TaskRegistry;

    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    async fn snapshot() -> TaskSnapshot {
        let registry = TaskRegistry::new();
        let task_id = registry
            .create(
                TaskSource::Url {
                    url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
                },
                "en",
            )
            .await;
        registry.get(&task_id).await.unwrap()
    }

    #[tokio::test]
    async fn created_task_round_trips() {
        let store = store().await;
        let task = snapshot().await;
        store.persist_created(&task).await.unwrap();

        let stored = store.load_task(&task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.language, "en");
        assert_eq!(
            stored.source_url.as_deref(),
            Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
        );
        assert!(stored.segments.is_none());
        assert!(store.load_task("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_and_results_are_projected() {
        let store = store().await;
        let task = snapshot().await;
        let t2 = task.task_id.as_str();
        store.persist_created(&task).await.unwrap();
        store
            .persist_status(
                t2,
                TaskStatus::Transcribing,
                25.0,
                Some(ProcessingStage::Transcription),
                None,
            )
            .await
            .unwrap();

        let stored = store.load_task(t2).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Transcribing);
        assert_eq!(stored.current_stage.as_deref(), Some("transcription"));

        let segment = Segment {
            start_time: 0.0,
            end_time: 30.0,
            title: "Intro".into(),
            summary: "Opening".into(),
            keywords: vec!["rust".into()],
            quizzes: vec![Quiz::short_answer("en", "Mascot?", vec!["Ferris".into()], false)],
        };
        let metadata = VideoMetadata {
            duration: 30.0,
            ..VideoMetadata::default()
        };
        store
            .persist_results(t2, &[segment.clone()], &metadata, "Rust intro")
            .await
            .unwrap();
        store
            .persist_status(t2, TaskStatus::Completed, 100.0, None, None)
            .await
            .unwrap();
        store
            .persist_video_location(t2, "file:///archive/t2/source.mp4")
            .await
            .unwrap();

        let stored = store.load_task(t2).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.title.as_deref(), Some("Rust intro"));
        assert_eq!(stored.segments, Some(vec![segment]));
        assert_eq!(stored.metadata.map(|m| m.duration), Some(30.0));
        assert_eq!(
            stored.video_location.as_deref(),
            Some("file:///archive/t2/source.mp4")
        );
    }

    #[tokio::test]
    async fn restart_interrupts_unfinished_rows() {
        let store = store().await;
        let running = snapshot().await;
        store.persist_created(&running).await.unwrap();
        store
            .persist_status(&running.task_id, TaskStatus::AnalyzingFrames, 60.0, None, None)
            .await
            .unwrap();
        let done = snapshot().await;
        store.persist_created(&done).await.unwrap();
        store
            .persist_status(&done.task_id, TaskStatus::Completed, 100.0, None, None)
            .await
            .unwrap();

        assert_eq!(store.interrupt_running_tasks().await.unwrap(), 1);

        let running = store.load_task(&running.task_id).await.unwrap().unwrap();
        assert_eq!(running.status, TaskStatus::Failed);
        assert_eq!(running.error.as_deref(), Some(INTERRUPTED_MESSAGE));
        let done = store.load_task(&done.task_id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn rows_survive_reopen_and_recover_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("vidquiz.db").display());

        let task = snapshot().await;
        {
            let store = SqliteStore::connect(&url).await.unwrap();
            store.persist_created(&task).await.unwrap();
            store
                .persist_status(
                    &task.task_id,
                    TaskStatus::Transcribing,
                    25.0,
                    Some(ProcessingStage::Transcription),
                    None,
                )
                .await
                .unwrap();
            store.pool.close().await;
        }

        let reopened = SqliteStore::connect(&url).await.unwrap();
        assert_eq!(reopened.interrupt_running_tasks().await.unwrap(), 1);
        let stored = reopened.load_task(&task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert!(stored.current_stage.is_none());
        assert_eq!(stored.progress, 25.0);
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let store = store().await;
        let task = snapshot().await;
        store.persist_created(&task).await.unwrap();
        assert!(store.delete_task(&task.task_id).await.unwrap());
        assert!(!store.delete_task(&task.task_id).await.unwrap());
        assert!(store.load_task(&task.task_id).await.unwrap().is_none());
    }
}
