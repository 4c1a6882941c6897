use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Url;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::{MIN_DOWNLOAD_BYTES, SourceError, SourceFetcher};

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "mov", "avi", "m4v"];

/// Streams a direct media URL to disk with a size cap and a total timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: u64,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(max_bytes: u64, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            max_bytes,
            timeout,
        }
    }

    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, SourceError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }
        if response.content_length().is_some_and(|len| len > self.max_bytes) {
            return Err(SourceError::TooLarge {
                max_mb: self.max_bytes / (1024 * 1024),
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            if written > self.max_bytes {
                return Err(SourceError::TooLarge {
                    max_mb: self.max_bytes / (1024 * 1024),
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn download(&self, url: &str, dest_dir: &Path) -> Result<PathBuf, SourceError> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(format!("source.{}", extension_for(url)));

        let outcome = tokio::time::timeout(self.timeout, self.fetch(url, &dest))
            .await
            .unwrap_or(Err(SourceError::Timeout(self.timeout)));

        let written = match outcome {
            Ok(n) if n < MIN_DOWNLOAD_BYTES => Err(SourceError::TooSmall(n)),
            other => other,
        };
        match written {
            Ok(bytes) => {
                info!(url, bytes, path = %dest.display(), "download finished");
                Ok(dest)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&dest).await;
                Err(e)
            }
        }
    }
}

/// File extension taken from the URL path when it looks like a video, else `mp4`.
fn extension_for(url: &str) -> &'static str {
    let ext = Url::parse(url).ok().and_then(|u| {
        u.path_segments()
            .and_then(|mut s| s.next_back().map(str::to_owned))
            .and_then(|name| name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()))
    });
    ext.and_then(|e| VIDEO_EXTENSIONS.iter().find(|v| **v == e).copied())
        .unwrap_or("mp4")
}
