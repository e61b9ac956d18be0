//! Adapter interfaces for external systems.
//!
//! The worker talks to the outside world through these traits so that
//! each side can be swapped (or faked in tests) independently:
//! - Downloader: fetch episode media into task scratch space
//! - Transcriber: turn a media file into timed segments
//! - TaskQueue: hand tasks to the processing side

pub mod http;
pub mod queue;
pub mod whisper;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::domain::Transcript;
use crate::error::ProcessError;
use crate::worker::scratch::TaskScratch;

pub use http::HttpDownloader;
pub use queue::{
    DeliveryReport, HttpTaskQueue, LocalQueue, QueueError, QueuePolicy, SubmitReceipt, TaskHandler, TaskQueue,
};
pub use whisper::{FakeTranscriber, WhisperTranscriber};

/// Fetches episode media
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download `url` into `scratch`, reserving scratch budget as bytes
    /// arrive. Returns the path of the downloaded file.
    async fn download(&self, url: &str, scratch: &mut TaskScratch) -> Result<PathBuf, ProcessError>;
}

/// Speech-to-text backend
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Transcribe a local media file
    async fn transcribe(&self, media: &Path) -> Result<Transcript, ProcessError>;
}

