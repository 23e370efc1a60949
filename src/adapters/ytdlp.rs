//! Source media downloader over yt-dlp.

use async_trait::async_trait;
use camino::Utf8Path;
use std::sync::Arc;
use std::time::Duration;

use super::run_command;
use crate::caps::{MediaDownloader, MediaInfo, MediaProcessor};
use crate::error::CapError;

/// yt-dlp subprocess adapter with bounded retries.
pub struct YtDlpDownloader {
    binary: String,
    prober: Arc<dyn MediaProcessor>,
    max_retries: u32,
}

impl YtDlpDownloader {
    #[must_use]
    pub fn new(binary: impl Into<String>, prober: Arc<dyn MediaProcessor>, max_retries: u32) -> Self {
        Self {
            binary: binary.into(),
            prober,
            max_retries,
        }
    }
}

#[async_trait]
impl MediaDownloader for YtDlpDownloader {
    async fn download(&self, url: &str, destination: &Utf8Path) -> Result<MediaInfo, CapError> {
        let args = vec![
            "--no-playlist".to_string(),
            "-f".to_string(),
            "bv*[ext=mp4]+ba[ext=m4a]/b[ext=mp4]/b".to_string(),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
            "-o".to_string(),
            destination.to_string(),
            url.to_string(),
        ];

        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
            }
            let output = run_command("downloader", &self.binary, &args, None).await?;
            if output.success() && destination.exists() {
                return self.prober.probe(destination).await;
            }
            last_error = output.stderr_tail().to_string();
            // An unavailable or removed video will never download.
            if last_error.contains("Video unavailable")
                || last_error.contains("Private video")
                || last_error.contains("removed")
            {
                return Err(CapError::fatal("downloader", last_error));
            }
            tracing::warn!(url, attempt, error = %last_error, "download attempt failed");
        }
        Err(CapError::transient(
            "downloader",
            format!("download failed after {} attempts: {last_error}", self.max_retries + 1),
        ))
    }
}
