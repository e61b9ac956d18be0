//! podscribe - deduplicating dispatch pipeline for podcast transcription
//!
//! Turns newly published podcast episodes into transcription jobs,
//! at least once and without duplicates.
//!
//! # Architecture
//!
//! ```text
//! trigger → Poller → Dispatcher ⇄ DedupStore
//!                        ↓
//!                    TaskQueue → Worker → ResultStore
//!                                   ↓
//!                               DedupStore (done / failed)
//! ```
//!
//! - Every guid has one durable record; all status changes are
//!   compare-and-set, so concurrent pollers and workers never both act
//! - The record is written before the task is enqueued; a sweep re-offers
//!   records whose task was lost
//! - Workers classify failures as transient or permanent and leave
//!   redelivery timing to the queue
//!
//! # Modules
//!
//! - `adapters`: Task queue, media download, transcription backends
//! - `core`: Dedup store, dispatcher, result store, retry and limits
//! - `domain`: Data structures (EpisodeCandidate, DispatchRecord, ProcessingTask)
//! - `ingest`: Feed fetching and the poll cycle
//! - `worker`: Per-task state machine and its HTTP endpoint
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # One poll cycle against the configured queue
//! podscribe poll
//!
//! # Everything in-process, no GPU needed
//! podscribe local --feed https://sr-restored.se/rss/5466 --fake
//!
//! # Inspect and replay failures
//! podscribe status --failed
//! podscribe replay <guid>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod ingest;
pub mod worker;

// Re-export main types at crate root for convenience
pub use crate::core::{DedupStore, Dispatcher, SqliteDedupStore};
pub use domain::{DispatchRecord, DispatchStatus, EpisodeCandidate, ProcessingTask, TaskOutcome};
pub use error::{ProcessError, Stage, StoreError};
pub use worker::Worker;
