use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use super::{MIN_DOWNLOAD_BYTES, SourceError, SourceFetcher};

/// Downloads video-sharing pages through the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    binary: PathBuf,
    max_bytes: u64,
    timeout: Duration,
}

impl YtDlpFetcher {
    /// Uses `YTDLP_PATH` when set, otherwise `yt-dlp` from `PATH`.
    pub fn new(max_bytes: u64, timeout: Duration) -> Self {
        let binary = std::env::var_os("YTDLP_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("yt-dlp"));
        Self {
            binary,
            max_bytes,
            timeout,
        }
    }

    fn args(&self, url: &str, dest_dir: &Path) -> Vec<String> {
        vec![
            "--no-playlist".into(),
            "--no-progress".into(),
            "-f".into(),
            "best[ext=mp4]/best".into(),
            "--max-filesize".into(),
            self.max_bytes.to_string(),
            "-o".into(),
            dest_dir.join("source.%(ext)s").display().to_string(),
            url.into(),
        ]
    }
}

#[async_trait]
impl SourceFetcher for YtDlpFetcher {
    async fn download(&self, url: &str, dest_dir: &Path) -> Result<PathBuf, SourceError> {
        tokio::fs::create_dir_all(dest_dir).await?;

        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args(url, dest_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd
            .spawn()
            .map_err(|e| SourceError::Tool(format!("failed to launch yt-dlp: {e}")))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| SourceError::Timeout(self.timeout))??;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            return Err(SourceError::Tool(format!("yt-dlp failed: {last}")));
        }

        let path = find_output(dest_dir)
            .await?
            .ok_or_else(|| SourceError::Tool("yt-dlp produced no file".to_owned()))?;
        let size = tokio::fs::metadata(&path).await?.len();
        if size < MIN_DOWNLOAD_BYTES {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(SourceError::TooSmall(size));
        }
        info!(url, bytes = size, path = %path.display(), "yt-dlp download finished");
        Ok(path)
    }
}

async fn find_output(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_source = path
            .file_stem()
            .is_some_and(|stem| stem == "source");
        let partial = path.extension().is_some_and(|e| e == "part" || e == "ytdl");
        if is_source && !partial {
            return Ok(Some(path));
        }
    }
    Ok(None)
}
