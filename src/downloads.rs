use crate::cache::part_path_for;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs as tokio_fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// Progress log throttling
const PROGRESS_TIME_THRESHOLD: Duration = Duration::from_millis(250);
const PROGRESS_BYTES_THRESHOLD: u64 = 512 * 1024;

static NEXT_ATTEMPT: AtomicU64 = AtomicU64::new(0);

/// Fresh `.part` path for one download attempt of `dest`.
fn next_part_path(dest: &Path) -> PathBuf {
    part_path_for(dest, NEXT_ATTEMPT.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server responded with HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("could not write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("download cancelled")]
    Cancelled,
}

/// Fetches a URL into a local file.
pub trait Downloader: Send + Sync {
    /// Download `url` to `dest`, returning the number of bytes written.
    ///
    /// `dest` only appears once the transfer has completed; a failed or
    /// cancelled download leaves nothing behind.
    fn download_to_file<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<u64, DownloadError>>;
}

pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    // No overall request timeout, only a connect timeout. Bodies are stored
    // exactly as sent.
    pub fn new(connect_timeout: Duration) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("fetchplay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        part_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            resp = self.client.get(url).header("Accept-Encoding", "identity").send() => resp?,
        };

        if !resp.status().is_success() {
            warn!("[download] Download failed with status {} for {}", resp.status(), url);
            return Err(DownloadError::Status(resp.status()));
        }

        let total_size = resp.content_length();
        debug!("[download] Response OK for {}, content-length={:?}", url, total_size);

        let io_err = |source| DownloadError::Io {
            path: part_path.to_path_buf(),
            source,
        };

        let file = tokio_fs::File::create(part_path).await.map_err(io_err)?;
        let mut file = BufWriter::with_capacity(64 * 1024, file);
        let mut stream = resp.bytes_stream();

        let mut total_written: u64 = 0;
        let mut last_progress_time = Instant::now();
        let mut last_progress_bytes = 0u64;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            file.write_all(&chunk).await.map_err(io_err)?;
            total_written += chunk.len() as u64;

            if last_progress_time.elapsed() >= PROGRESS_TIME_THRESHOLD
                || total_written - last_progress_bytes >= PROGRESS_BYTES_THRESHOLD
            {
                debug!(
                    "[download] {}: {} / {} bytes",
                    url,
                    total_written,
                    total_size.map(|t| t.to_string()).unwrap_or_else(|| "?".to_string())
                );
                last_progress_time = Instant::now();
                last_progress_bytes = total_written;
            }
        }

        file.flush().await.map_err(io_err)?;
        drop(file);

        tokio_fs::rename(part_path, dest)
            .await
            .map_err(|source| DownloadError::Io {
                path: dest.to_path_buf(),
                source,
            })?;

        Ok(total_written)
    }
}

impl Downloader for HttpDownloader {
    fn download_to_file<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<u64, DownloadError>> {
        Box::pin(async move {
            info!("[download] Starting download of {} to {}", url, dest.display());
            let part_path = next_part_path(dest);
            let result = self.fetch(url, dest, &part_path, &cancel).await;
            match &result {
                Ok(bytes) => info!("[download] Completed {} ({} bytes)", dest.display(), bytes),
                Err(e) => {
                    warn!("[download] Download of {} did not complete: {}", url, e);
                    if tokio_fs::try_exists(&part_path).await.unwrap_or(false) {
                        if let Err(e) = tokio_fs::remove_file(&part_path).await {
                            warn!("[download] Failed to remove {}: {}", part_path.display(), e);
                        }
                    }
                }
            }
            result
        })
    }
}
