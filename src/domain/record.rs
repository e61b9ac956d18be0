//! Durable dispatch records.
//!
//! A `DispatchRecord` is created the first time a guid is seen and is never
//! deleted. Its status is the only shared state between the dispatcher and
//! the workers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::episode::EpisodeCandidate;

/// Lifecycle of a guid through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// Seen, not yet handed to the queue
    Pending,

    /// Task submitted, no worker has claimed it yet
    Dispatched,

    /// A worker has claimed the task
    Processing,

    /// Transcription stored
    Done,

    /// Gave up (permanent error, exhausted deliveries, or enqueue failure)
    Failed,
}

impl DispatchStatus {
    pub const ALL: [DispatchStatus; 5] = [
        Self::Pending,
        Self::Dispatched,
        Self::Processing,
        Self::Done,
        Self::Failed,
    ];

    /// Stable storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// A live task exists for the guid
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Dispatched | Self::Processing)
    }
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown dispatch status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for DispatchStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Why a record ended up in `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The queue never accepted the task
    Enqueue,

    /// Transient errors until the delivery (or dispatch) budget ran out
    TransientExhausted,

    /// Malformed input, unsupported media, unrecoverable 4xx
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueue => "enqueue",
            Self::TransientExhausted => "transient_exhausted",
            Self::Permanent => "permanent",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueue" => Ok(Self::Enqueue),
            "transient_exhausted" => Ok(Self::TransientExhausted),
            "permanent" => Ok(Self::Permanent),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Dispatch state for one guid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    /// Episode guid (primary key)
    pub guid: String,

    /// Episode title, for operator output
    pub title: Option<String>,

    /// Feed item description
    #[serde(default)]
    pub description: Option<String>,

    /// Feed item publish date
    #[serde(default)]
    pub publish_date: Option<DateTime<Utc>>,

    /// Media URL, kept so stale records can be re-offered
    pub media_url: String,

    /// Current status
    pub status: DispatchStatus,

    /// Number of dispatch attempts (not queue deliveries)
    pub attempt_count: u32,

    /// When the guid was first seen
    pub first_seen_at: DateTime<Utc>,

    /// Last status change
    pub last_updated_at: DateTime<Utc>,

    /// Failure classification when status is `failed`
    pub failure: Option<FailureKind>,

    /// Last error message
    pub last_error: Option<String>,
}

impl DispatchRecord {
    /// A fresh pending record for a first sighting
    pub fn pending(candidate: &EpisodeCandidate, now: DateTime<Utc>) -> Self {
        Self {
            guid: candidate.guid.clone(),
            title: Some(candidate.title.clone()),
            description: candidate.description.clone(),
            publish_date: candidate.publish_date,
            media_url: candidate.media_url.clone(),
            status: DispatchStatus::Pending,
            attempt_count: 0,
            first_seen_at: now,
            last_updated_at: now,
            failure: None,
            last_error: None,
        }
    }

    /// Whether another dispatch attempt is allowed
    pub fn has_attempts_left(&self, max_attempts: u32) -> bool {
        self.attempt_count < max_attempts
    }
}
