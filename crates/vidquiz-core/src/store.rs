//! Durable projection of task state.
//!
//! The in-memory registry is authoritative while a task runs. Implementations
//! of [`DurableStore`] receive a copy of each transition and are never read
//! to decide what a run does next.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::model::{Segment, VideoMetadata};
use crate::runtime::storage::TaskSnapshot;
use crate::runtime::types::{ProcessingStage, TaskStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store call timed out")]
    Timeout,
}

/// A task as recorded in durable storage.
#[derive(Debug, Clone, Serialize)]
pub struct StoredTask {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub current_stage: Option<String>,
    pub error: Option<String>,
    pub language: String,
    pub source_url: Option<String>,
    /// Local path or remote object key of the video.
    pub video_location: Option<String>,
    pub title: Option<String>,
    pub metadata: Option<VideoMetadata>,
    pub segments: Option<Vec<Segment>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence port called by the orchestrator at every transition.
///
/// The orchestrator treats every call as fire-and-forget: errors are logged
/// and never change the outcome of a run.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn persist_created(&self, task: &TaskSnapshot) -> Result<(), StoreError>;

    async fn persist_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        progress: f64,
        stage: Option<ProcessingStage>,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn persist_video_location(&self, task_id: &str, location: &str)
    -> Result<(), StoreError>;

    async fn persist_results(
        &self,
        task_id: &str,
        segments: &[Segment],
        metadata: &VideoMetadata,
        title: &str,
    ) -> Result<(), StoreError>;

    async fn load_task(&self, task_id: &str) -> Result<Option<StoredTask>, StoreError>;
}

/// Store that accepts and forgets everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

#[async_trait]
impl DurableStore for NullStore {
    async fn persist_created(&self, _task: &TaskSnapshot) -> Result<(), StoreError> {
        Ok(())
    }

    async fn persist_status(
        &self,
        _task_id: &str,
        _status: TaskStatus,
        _progress: f64,
        _stage: Option<ProcessingStage>,
        _error: Option<&str>,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn persist_video_location(
        &self,
        _task_id: &str,
        _location: &str,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn persist_results(
        &self,
        _task_id: &str,
        _segments: &[Segment],
        _metadata: &VideoMetadata,
        _title: &str,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load_task(&self, _task_id: &str) -> Result<Option<StoredTask>, StoreError> {
        Ok(None)
    }
}
