//! Error taxonomy shared by the stores and the worker.
//!
//! Worker failures are classified, not retried, here: `Transient` means the
//! queue may redeliver, `Permanent` means stop now, `Consistency` means a
//! compare-and-set lost to someone else who is already handling the guid.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::domain::DispatchStatus;

/// Worker pipeline stages, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Downloading,
    Transcribing,
    WritingResult,
    Acknowledged,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Downloading => "downloading",
            Self::Transcribing => "transcribing",
            Self::WritingResult => "writing_result",
            Self::Acknowledged => "acknowledged",
        };
        f.write_str(name)
    }
}

/// Classified failure of one task delivery
#[derive(Debug, Clone, Error)]
pub enum ProcessError {
    #[error("transient failure while {stage}: {message}")]
    Transient { stage: Stage, message: String },

    #[error("permanent failure while {stage}: {message}")]
    Permanent { stage: Stage, message: String },

    #[error("{guid} is already handled elsewhere (status: {found:?})")]
    Consistency {
        guid: String,
        found: Option<DispatchStatus>,
    },
}

impl ProcessError {
    pub fn transient(stage: Stage, message: impl Into<String>) -> Self {
        Self::Transient {
            stage,
            message: message.into(),
        }
    }

    pub fn permanent(stage: Stage, message: impl Into<String>) -> Self {
        Self::Permanent {
            stage,
            message: message.into(),
        }
    }

    /// Whether a redelivery could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::Transient { stage, .. } | Self::Permanent { stage, .. } => *stage,
            Self::Consistency { .. } => Stage::Received,
        }
    }
}

/// Errors from the dedup and result stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}
