//! HTTP media downloader.
//!
//! Streams the response body into the task's scratch directory, reserving
//! scratch budget chunk by chunk. Failures are classified for the worker:
//! network errors, timeouts, 408/429 and 5xx are transient; other 4xx,
//! oversized and empty media are permanent.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::error::{ProcessError, Stage};
use crate::worker::scratch::{ScratchError, TaskScratch};

use super::Downloader;

/// Downloads media over HTTP(S)
pub struct HttpDownloader {
    client: reqwest::Client,
    max_media_bytes: u64,
}

impl HttpDownloader {
    /// Create a downloader with a per-file size cap.
    ///
    /// `connect_timeout` bounds connection setup only; the worker's stage
    /// timeout bounds the whole download.
    pub fn new(max_media_bytes: u64, connect_timeout: Duration) -> Result<Self, ProcessError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("podscribe/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProcessError::permanent(Stage::Downloading, format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_media_bytes,
        })
    }

    fn too_large(&self, bytes: u64) -> ProcessError {
        ProcessError::permanent(
            Stage::Downloading,
            format!("media exceeds {} byte limit ({} bytes)", self.max_media_bytes, bytes),
        )
    }
}

/// Classify a non-success HTTP status
pub fn classify_status(status: StatusCode) -> ProcessError {
    let message = format!("HTTP {}", status);
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
        ProcessError::transient(Stage::Downloading, message)
    } else {
        ProcessError::permanent(Stage::Downloading, message)
    }
}

fn classify_request_error(e: reqwest::Error) -> ProcessError {
    if e.is_builder() {
        ProcessError::permanent(Stage::Downloading, format!("invalid media URL: {}", e))
    } else {
        ProcessError::transient(Stage::Downloading, e.to_string())
    }
}

fn classify_scratch_error(e: ScratchError) -> ProcessError {
    // Budget frees up as other tasks finish; I/O here is local disk trouble
    ProcessError::transient(Stage::Downloading, e.to_string())
}

#[async_trait]
impl Downloader for HttpDownloader {
    #[instrument(skip(self, scratch))]
    async fn download(&self, url: &str, scratch: &mut TaskScratch) -> Result<PathBuf, ProcessError> {
        let mut response = self.client.get(url).send().await.map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_media_bytes {
                return Err(self.too_large(length));
            }
            scratch.ensure_reserved(length).map_err(classify_scratch_error)?;
        }

        let path = scratch.media_path(url);
        let mut file = File::create(&path)
            .await
            .map_err(|e| ProcessError::transient(Stage::Downloading, format!("cannot create media file: {}", e)))?;

        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(classify_request_error)? {
            written += chunk.len() as u64;
            if written > self.max_media_bytes {
                return Err(self.too_large(written));
            }
            scratch.ensure_reserved(written).map_err(classify_scratch_error)?;

            file.write_all(&chunk)
                .await
                .map_err(|e| ProcessError::transient(Stage::Downloading, format!("write failed: {}", e)))?;
        }

        file.flush()
            .await
            .map_err(|e| ProcessError::transient(Stage::Downloading, format!("flush failed: {}", e)))?;

        if written == 0 {
            return Err(ProcessError::permanent(Stage::Downloading, "media is empty"));
        }

        debug!(bytes = written, path = %path.display(), "Media downloaded");
        Ok(path)
    }
}
