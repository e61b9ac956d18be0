//! Dispatcher: one task per new episode, durable record first.
//!
//! For every candidate the dedup store decides whether a task is needed.
//! When it is, the record is moved to `dispatched` (incrementing its
//! attempt count) before the task is submitted. A submit that is lost after
//! that write leaves a stale `dispatched` record behind; [`Dispatcher::reconcile`]
//! finds those (and stale `processing` records left by dead workers) and
//! offers them again through the same path. A stale record whose result is
//! already stored is completed instead; the worker died between writing the
//! result and marking the record done.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::queue::{QueueError, SubmitReceipt, TaskQueue};
use crate::domain::{DispatchRecord, DispatchStatus, EpisodeCandidate, FailureKind, ProcessingTask};
use crate::error::StoreError;

use super::dedup_store::DedupStore;
use super::result_store::ResultStore;
use super::retry::RetryPolicy;

/// Dispatcher configuration (the `dispatch` config section)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchPolicy {
    /// Dispatch attempts per guid before it is left failed (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Age after which a `dispatched` record is considered lost (default: 1800 = 30 min)
    #[serde(default = "default_stale_dispatched")]
    pub stale_dispatched_after_secs: u64,

    /// Age after which a `processing` record is considered abandoned.
    /// Must exceed the worker task timeout (default: 7200 = 2 hours)
    #[serde(default = "default_stale_processing")]
    pub stale_processing_after_secs: u64,

    /// Backoff for failed submit calls
    #[serde(default)]
    pub enqueue_retry: RetryPolicy,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_stale_dispatched() -> u64 {
    1800
} // 30 min
fn default_stale_processing() -> u64 {
    7200
} // 2 hours

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            stale_dispatched_after_secs: default_stale_dispatched(),
            stale_processing_after_secs: default_stale_processing(),
            enqueue_retry: RetryPolicy::default(),
        }
    }
}

/// Why a candidate produced no task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyDone,
    InFlight,
    PermanentlyFailed,
}

/// What to do with a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Move the record from this status to `dispatched` and submit
    Enqueue(DispatchStatus),
    Skip(SkipReason),
}

/// Decide whether a record needs a task.
///
/// A `permanent` failure is never retried. Other failures are retried
/// while attempts remain.
pub fn decide(record: &DispatchRecord, max_attempts: u32) -> Decision {
    match record.status {
        DispatchStatus::Pending => Decision::Enqueue(DispatchStatus::Pending),
        DispatchStatus::Done => Decision::Skip(SkipReason::AlreadyDone),
        DispatchStatus::Dispatched | DispatchStatus::Processing => Decision::Skip(SkipReason::InFlight),
        DispatchStatus::Failed => {
            if record.failure != Some(FailureKind::Permanent) && record.has_attempts_left(max_attempts) {
                Decision::Enqueue(DispatchStatus::Failed)
            } else {
                Decision::Skip(SkipReason::PermanentlyFailed)
            }
        }
    }
}

/// Result of one dispatch pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    /// Tasks submitted
    pub enqueued: usize,

    /// Candidates that needed no task (done, in flight, or lost a CAS race)
    pub skipped: usize,

    /// Submits that failed after retries; records left `failed`
    pub enqueue_failed: usize,

    /// Guids that are failed with no attempts left
    pub permanent_failures: Vec<String>,
}

/// Result of one reconciliation sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    /// Stale records found
    pub swept: usize,

    /// Stale records that already had a stored result and were marked done
    pub completed: usize,

    /// Stale records submitted again
    pub reoffered: usize,

    /// Stale records that had no attempts left and were failed
    pub exhausted: usize,

    /// Re-offers whose submit failed
    pub enqueue_failed: usize,
}

/// Outcome of enqueueing a single record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Enqueued {
    Submitted,
    LostRace,
    Failed,
}

/// Turns candidates into tasks
pub struct Dispatcher {
    store: Arc<dyn DedupStore>,
    queue: Arc<dyn TaskQueue>,
    results: Arc<dyn ResultStore>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn DedupStore>,
        queue: Arc<dyn TaskQueue>,
        results: Arc<dyn ResultStore>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            results,
            policy,
        }
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Dispatch a batch of candidates.
    ///
    /// Store errors abort the pass; queue errors only affect their candidate.
    #[instrument(skip(self, candidates), fields(candidates = candidates.len(), queue = self.queue.name()))]
    pub async fn dispatch(
        &self,
        candidates: &[EpisodeCandidate],
        trace_id: Option<&str>,
    ) -> Result<DispatchSummary, StoreError> {
        let mut summary = DispatchSummary::default();

        for candidate in candidates {
            let (record, created) = self.store.create_if_absent(candidate, Utc::now())?;
            if created {
                debug!(guid = %record.guid, "New episode");
            }

            match decide(&record, self.policy.max_attempts) {
                Decision::Enqueue(expected) => match self.enqueue(&record, expected, trace_id).await? {
                    Enqueued::Submitted => summary.enqueued += 1,
                    Enqueued::LostRace => summary.skipped += 1,
                    Enqueued::Failed => summary.enqueue_failed += 1,
                },
                Decision::Skip(SkipReason::PermanentlyFailed) => {
                    summary.skipped += 1;
                    if !summary.permanent_failures.contains(&record.guid) {
                        error!(
                            alert = true,
                            guid = %record.guid,
                            attempt_count = record.attempt_count,
                            failure = ?record.failure,
                            last_error = record.last_error.as_deref().unwrap_or(""),
                            "Episode permanently failed; needs manual replay"
                        );
                        summary.permanent_failures.push(record.guid.clone());
                    }
                }
                Decision::Skip(reason) => {
                    debug!(guid = %record.guid, ?reason, "Skipping");
                    summary.skipped += 1;
                }
            }
        }

        info!(
            enqueued = summary.enqueued,
            skipped = summary.skipped,
            enqueue_failed = summary.enqueue_failed,
            permanent_failures = summary.permanent_failures.len(),
            "Dispatch complete"
        );

        Ok(summary)
    }

    /// Re-offer records stuck in `dispatched` or `processing`
    #[instrument(skip(self))]
    pub async fn reconcile(&self, trace_id: Option<&str>) -> Result<ReconcileSummary, StoreError> {
        let mut summary = ReconcileSummary::default();
        let now = Utc::now();

        let stale = [
            (DispatchStatus::Dispatched, self.policy.stale_dispatched_after_secs),
            (DispatchStatus::Processing, self.policy.stale_processing_after_secs),
        ];

        for (status, after_secs) in stale {
            let cutoff = now - ChronoDuration::seconds(after_secs as i64);

            for guid in self.store.sweep(status, cutoff)? {
                summary.swept += 1;

                if self.results.contains(&guid).await? {
                    if self.store.transition(&guid, status, DispatchStatus::Done)? {
                        info!(%guid, %status, "Stale record already has a result, marked done");
                        summary.completed += 1;
                    }
                    continue;
                }

                // Back to pending first so only one sweeper wins
                if !self.store.transition(&guid, status, DispatchStatus::Pending)? {
                    debug!(%guid, %status, "Record moved on before sweep, skipping");
                    continue;
                }

                let Some(record) = self.store.get(&guid)? else {
                    continue;
                };

                warn!(%guid, %status, attempt_count = record.attempt_count, "Stale record swept");

                if !record.has_attempts_left(self.policy.max_attempts) {
                    let message = format!("stale in {} with no dispatch attempts left", status);
                    if self.store.fail(
                        &guid,
                        DispatchStatus::Pending,
                        FailureKind::TransientExhausted,
                        &message,
                    )? {
                        error!(alert = true, %guid, attempt_count = record.attempt_count, "{}", message);
                        summary.exhausted += 1;
                    }
                    continue;
                }

                match self.enqueue(&record, DispatchStatus::Pending, trace_id).await? {
                    Enqueued::Submitted => summary.reoffered += 1,
                    Enqueued::LostRace => {}
                    Enqueued::Failed => summary.enqueue_failed += 1,
                }
            }
        }

        if summary.swept > 0 {
            info!(
                swept = summary.swept,
                completed = summary.completed,
                reoffered = summary.reoffered,
                exhausted = summary.exhausted,
                "Reconcile complete"
            );
        }

        Ok(summary)
    }

    /// Move the record to `dispatched`, then submit with backoff
    async fn enqueue(
        &self,
        record: &DispatchRecord,
        expected: DispatchStatus,
        trace_id: Option<&str>,
    ) -> Result<Enqueued, StoreError> {
        if !self.store.begin_dispatch(&record.guid, expected)? {
            // Another poller got there first
            debug!(guid = %record.guid, %expected, "Dispatch compare-and-set missed");
            return Ok(Enqueued::LostRace);
        }

        let task = ProcessingTask::for_record(record, trace_id);
        let retry = &self.policy.enqueue_retry;
        let mut attempt = 1;

        loop {
            match self.queue.submit(&task).await {
                Ok(receipt) => {
                    if receipt == SubmitReceipt::Duplicate {
                        debug!(guid = %task.guid, "Queue already holds a live task for this guid");
                    }
                    info!(guid = %task.guid, task_id = %task.task_id, "Task enqueued");
                    return Ok(Enqueued::Submitted);
                }
                Err(e) if e.is_retryable() && retry.should_retry(attempt) => {
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        guid = %task.guid,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Enqueue failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return self.record_enqueue_failure(&task.guid, &e);
                }
            }
        }
    }

    fn record_enqueue_failure(&self, guid: &str, e: &QueueError) -> Result<Enqueued, StoreError> {
        if !self
            .store
            .fail(guid, DispatchStatus::Dispatched, FailureKind::Enqueue, &e.to_string())?
        {
            // A sweep or worker moved the record while we were retrying
            warn!(%guid, error = %e, "Enqueue failed but the record moved on, leaving it");
            return Ok(Enqueued::LostRace);
        }
        error!(alert = true, %guid, error = %e, "Enqueue failed");
        Ok(Enqueued::Failed)
    }
}
