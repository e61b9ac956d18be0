//! Domain types for the dispatch pipeline.
//!
//! This module contains the core data structures:
//! - EpisodeCandidate: what a feed poll produces
//! - DispatchRecord / DispatchEvent: durable dispatch state and its history
//! - ProcessingTask / TaskOutcome: queue messages and worker verdicts
//! - TranscriptionResult: what the worker stores

pub mod episode;
pub mod events;
pub mod record;
pub mod task;
pub mod transcript;

// Re-export commonly used types
pub use episode::EpisodeCandidate;
pub use events::DispatchEvent;
pub use record::{DispatchRecord, DispatchStatus, FailureKind, UnknownStatus};
pub use task::{ProcessingTask, TaskOutcome};
pub use transcript::{EpisodeInfo, ModelMetadata, Segment, Transcript, TranscriptionResult};
