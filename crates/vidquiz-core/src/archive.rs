//! Long-term storage for finished videos.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive rejected upload: {0}")]
    Rejected(String),
}

/// Destination for the original video once a task completes.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `local` for `task_id` and return the key it can be found under.
    async fn upload_video(&self, task_id: &str, local: &Path) -> Result<String, ArchiveError>;
}

/// Archive rooted at a local or mounted directory.
#[derive(Debug, Clone)]
pub struct DirectoryArchive {
    root: PathBuf,
}

impl DirectoryArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactStore for DirectoryArchive {
    async fn upload_video(&self, task_id: &str, local: &Path) -> Result<String, ArchiveError> {
        let name = local
            .file_name()
            .ok_or_else(|| ArchiveError::Rejected(format!("{} has no file name", local.display())))?;
        let dir = self.root.join(task_id);
        tokio::fs::create_dir_all(&dir).await?;
        let dest = dir.join(name);
        tokio::fs::copy(local, &dest).await?;
        Ok(format!("file://{}", dest.display()))
    }
}
