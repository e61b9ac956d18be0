//! Core dispatch logic.
//!
//! This module contains:
//! - DedupStore: durable guid → dispatch record mapping
//! - Dispatcher: candidate filtering, enqueue and stale-record reconciliation
//! - ResultStore: durable transcription output
//! - RetryPolicy / WorkerLimits: backoff and resource bounds

pub mod dedup_store;
pub mod dispatcher;
pub mod limits;
pub mod result_store;
pub mod retry;

// Re-export commonly used types
pub use dedup_store::{DedupStore, SqliteDedupStore, StatusCounts};
pub use dispatcher::{decide, Decision, DispatchPolicy, DispatchSummary, Dispatcher, ReconcileSummary, SkipReason};
pub use limits::{LimitsError, WorkerLimits};
pub use result_store::{result_key, LocalResultStore, ResultStore};
pub use retry::RetryPolicy;
