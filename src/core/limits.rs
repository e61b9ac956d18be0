//! Resource limits for the processor worker.
//!
//! Bounds how much a worker may do at once and for how long:
//! - Concurrent tasks (admission)
//! - Per-stage and per-task timeouts
//! - Scratch disk usage and per-file media size
//! - Delivery attempts before a transient failure becomes terminal

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Worker limits, loaded from the `worker` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerLimits {
    /// Maximum tasks processed at once (default: 1, GPUs are scarce)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Download stage timeout in seconds (default: 300 = 5 min)
    #[serde(default = "default_download_timeout")]
    pub download_timeout_seconds: u64,

    /// Transcription stage timeout in seconds (default: 1800 = 30 min)
    #[serde(default = "default_transcribe_timeout")]
    pub transcribe_timeout_seconds: u64,

    /// Result write timeout in seconds (default: 60)
    #[serde(default = "default_write_timeout")]
    pub write_timeout_seconds: u64,

    /// Whole-task timeout in seconds; should match the queue's
    /// acknowledgment deadline (default: 3600 = 1 hour)
    #[serde(default = "default_task_timeout")]
    pub task_timeout_seconds: u64,

    /// Total scratch disk budget across concurrent tasks (default: 2GB)
    #[serde(default = "default_max_scratch_bytes")]
    pub max_scratch_bytes: u64,

    /// Largest single media file accepted (default: 1GB)
    #[serde(default = "default_max_media_bytes")]
    pub max_media_bytes: u64,

    /// Must equal the queue's max attempts; the delivery that reaches it
    /// turns a transient failure into a terminal one (default: 5)
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
}

fn default_concurrency() -> usize {
    1
}
fn default_download_timeout() -> u64 {
    300
} // 5 min
fn default_transcribe_timeout() -> u64 {
    1800
} // 30 min
fn default_write_timeout() -> u64 {
    60
}
fn default_task_timeout() -> u64 {
    3600
} // 1 hour
fn default_max_scratch_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
} // 2GB
fn default_max_media_bytes() -> u64 {
    1024 * 1024 * 1024
} // 1GB
fn default_max_delivery_attempts() -> u32 {
    5
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            download_timeout_seconds: default_download_timeout(),
            transcribe_timeout_seconds: default_transcribe_timeout(),
            write_timeout_seconds: default_write_timeout(),
            task_timeout_seconds: default_task_timeout(),
            max_scratch_bytes: default_max_scratch_bytes(),
            max_media_bytes: default_max_media_bytes(),
            max_delivery_attempts: default_max_delivery_attempts(),
        }
    }
}

impl WorkerLimits {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_seconds)
    }

    pub fn transcribe_timeout(&self) -> Duration {
        Duration::from_secs(self.transcribe_timeout_seconds)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_seconds)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_seconds)
    }

    /// Whether this delivery is the last one the queue will make
    pub fn is_final_delivery(&self, delivery_attempt: u32) -> bool {
        delivery_attempt >= self.max_delivery_attempts
    }

    /// Reject configurations the worker cannot run with
    pub fn validate(&self) -> Result<(), LimitsError> {
        if self.concurrency == 0 {
            return Err(LimitsError::ZeroConcurrency);
        }
        if self.max_delivery_attempts == 0 {
            return Err(LimitsError::ZeroDeliveryAttempts);
        }
        if self.max_media_bytes > self.max_scratch_bytes {
            return Err(LimitsError::MediaExceedsScratch {
                media: self.max_media_bytes,
                scratch: self.max_scratch_bytes,
            });
        }
        Ok(())
    }
}

/// Invalid limit combinations
#[derive(Debug, Clone, Error)]
pub enum LimitsError {
    #[error("worker concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("max_delivery_attempts must be at least 1")]
    ZeroDeliveryAttempts,

    #[error("max_media_bytes ({media}) exceeds max_scratch_bytes ({scratch})")]
    MediaExceedsScratch { media: u64, scratch: u64 },
}
