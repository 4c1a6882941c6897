//! Getting a video onto local disk: remote downloads and streamed uploads.

mod http;
mod ytdlp;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Url;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::media::ValidationError;

pub use http::HttpFetcher;
pub use ytdlp::YtDlpFetcher;

/// Smallest file accepted as a real video download.
pub const MIN_DOWNLOAD_BYTES: u64 = 1024;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("http error: {0}")]
    Http(String),

    #[error("server returned status {0}")]
    Status(u16),

    #[error("download exceeds the {max_mb} MB limit")]
    TooLarge { max_mb: u64 },

    #[error("downloaded file is too small ({0} bytes), likely not a video")]
    TooSmall(u64),

    #[error("download timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("{0}")]
    Tool(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        SourceError::Http(e.to_string())
    }
}

/// Fetches a remote video into a task-scoped directory.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Download `url` into `dest_dir` and return the local file path.
    async fn download(&self, url: &str, dest_dir: &Path) -> Result<PathBuf, SourceError>;
}

/// Sends hosted video pages to yt-dlp and everything else to plain HTTP.
pub struct RoutingFetcher {
    direct: Arc<dyn SourceFetcher>,
    hosted: Arc<dyn SourceFetcher>,
}

impl RoutingFetcher {
    pub fn new(direct: Arc<dyn SourceFetcher>, hosted: Arc<dyn SourceFetcher>) -> Self {
        Self { direct, hosted }
    }
}

#[async_trait]
impl SourceFetcher for RoutingFetcher {
    async fn download(&self, url: &str, dest_dir: &Path) -> Result<PathBuf, SourceError> {
        if is_hosted_page(url) {
            self.hosted.download(url, dest_dir).await
        } else {
            self.direct.download(url, dest_dir).await
        }
    }
}

const HOSTED_DOMAINS: &[&str] = &["youtube.com", "youtu.be", "vimeo.com", "dailymotion.com"];

/// `true` for video-sharing pages that need an extractor rather than a GET.
pub fn is_hosted_page(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .is_some_and(|host| {
            HOSTED_DOMAINS
                .iter()
                .any(|d| host == *d || host.ends_with(&format!(".{d}")))
        })
}

/// Validate a submitted URL and bring it to a canonical form.
///
/// Only `http`/`https` URLs with a host are accepted. YouTube watch, shorts,
/// embed and `youtu.be` links collapse to `https://www.youtube.com/watch?v=<id>`
/// so that equivalent links share one task.
pub fn normalize_url(raw: &str) -> Result<String, ValidationError> {
    let cleaned = raw.trim().replace('\\', "");
    let url = Url::parse(&cleaned).map_err(|e| ValidationError::MalformedUrl(format!("{cleaned}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::MalformedUrl(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| ValidationError::MalformedUrl(format!("{cleaned}: missing host")))?;

    if let Some(id) = youtube_id(&url, &host) {
        return Ok(format!("https://www.youtube.com/watch?v={id}"));
    }
    Ok(url.to_string())
}

fn valid_video_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn youtube_id(url: &Url, host: &str) -> Option<String> {
    if host == "youtu.be" {
        let id = url.path_segments()?.next()?;
        return valid_video_id(id).then(|| id.to_owned());
    }
    if host != "youtube.com" && !host.ends_with(".youtube.com") {
        return None;
    }
    let mut segments = url.path_segments()?;
    match segments.next()? {
        "watch" => url
            .query_pairs()
            .find(|(k, _)| k == "v")
            .map(|(_, v)| v.into_owned())
            .filter(|id| valid_video_id(id)),
        "shorts" | "embed" | "live" => {
            let id = segments.next()?;
            valid_video_id(id).then(|| id.to_owned())
        }
        _ => None,
    }
}

/// Stream an upload body to `dest`, refusing bodies larger than `max_bytes`.
///
/// A partially written file is removed on failure.
pub async fn save_upload<S, E>(mut body: S, dest: &Path, max_bytes: u64) -> Result<u64, SourceError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send,
    E: std::fmt::Display,
{
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(dest).await?;
    let mut written: u64 = 0;

    let result: Result<(), SourceError> = async {
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| SourceError::Http(e.to_string()))?;
            written += chunk.len() as u64;
            if written > max_bytes {
                return Err(SourceError::TooLarge {
                    max_mb: max_bytes / (1024 * 1024),
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        drop(file);
        let _ = tokio::fs::remove_file(dest).await;
        return Err(e);
    }
    Ok(written)
}
