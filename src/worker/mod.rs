//! Processor worker.
//!
//! Handles one delivery of a [`ProcessingTask`]:
//!
//! ```text
//! received → downloading → transcribing → writing_result → acknowledged
//!     └──────────────┴─────────────┴──────────────┴──→ failed
//! ```
//!
//! The worker classifies failures and reports a [`TaskOutcome`]; the queue
//! decides when (and whether) to redeliver. Nothing here sleeps or backs off.

pub mod scratch;
pub mod server;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::queue::TaskHandler;
use crate::adapters::{Downloader, Transcriber};
use crate::core::dedup_store::DedupStore;
use crate::core::limits::WorkerLimits;
use crate::core::result_store::ResultStore;
use crate::domain::{DispatchStatus, FailureKind, ProcessingTask, TaskOutcome, TranscriptionResult};
use crate::error::{ProcessError, Stage};

pub use scratch::{ScratchError, ScratchSpace, TaskScratch};
pub use server::{router, serve, status_for};

/// Runs tasks through the processing stages
pub struct Worker {
    store: Arc<dyn DedupStore>,
    results: Arc<dyn ResultStore>,
    downloader: Arc<dyn Downloader>,
    transcriber: Arc<dyn Transcriber>,
    scratch: ScratchSpace,
    limits: WorkerLimits,

    /// Admission gate, independent of the queue's own dispatch limit
    admission: Semaphore,
}

impl Worker {
    pub fn new(
        store: Arc<dyn DedupStore>,
        results: Arc<dyn ResultStore>,
        downloader: Arc<dyn Downloader>,
        transcriber: Arc<dyn Transcriber>,
        scratch: ScratchSpace,
        limits: WorkerLimits,
    ) -> Self {
        let admission = Semaphore::new(limits.concurrency.max(1));
        Self {
            store,
            results,
            downloader,
            transcriber,
            scratch,
            limits,
            admission,
        }
    }

    pub fn limits(&self) -> &WorkerLimits {
        &self.limits
    }

    /// Tasks that could be admitted right now
    pub fn available_slots(&self) -> usize {
        self.admission.available_permits()
    }

    /// Remove scratch directories left by a previous crashed run
    pub fn purge_scratch(&self) -> usize {
        match self.scratch.purge_orphans(self.limits.task_timeout()) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "Scratch purge failed");
                0
            }
        }
    }

    /// Process one delivery
    #[instrument(
        skip(self, task),
        fields(
            guid = %task.guid,
            delivery_attempt = task.delivery_attempt,
            trace_id = task.trace_id.as_deref().unwrap_or("")
        )
    )]
    pub async fn process(&self, task: ProcessingTask) -> TaskOutcome {
        let Ok(_permit) = self.admission.try_acquire() else {
            debug!("Worker at capacity");
            return TaskOutcome::Busy;
        };

        let mut stage = Stage::Received;
        let limit = self.limits.task_timeout();

        let timed = tokio::time::timeout(limit, self.run(&task, &mut stage)).await;
        let result = match timed {
            Ok(result) => result,
            Err(_) => Err(ProcessError::transient(
                stage,
                format!("task timed out after {}s", limit.as_secs()),
            )),
        };

        match result {
            Ok(location) => {
                info!(%location, "Episode transcribed");
                TaskOutcome::Completed
            }
            Err(e) => self.handle_failure(&task, e),
        }
    }

    /// The stage pipeline. `stage` tracks progress for timeout reporting.
    async fn run(&self, task: &ProcessingTask, stage: &mut Stage) -> Result<String, ProcessError> {
        *stage = Stage::Received;
        self.claim(task)?;

        // Dropped on every exit path, which frees the directory and budget
        let mut scratch = self
            .scratch
            .allocate()
            .map_err(|e| ProcessError::transient(Stage::Received, e.to_string()))?;

        *stage = Stage::Downloading;
        let media = within(
            Stage::Downloading,
            self.limits.download_timeout(),
            self.downloader.download(&task.media_url, &mut scratch),
        )
        .await?;

        *stage = Stage::Transcribing;
        let transcript = within(
            Stage::Transcribing,
            self.limits.transcribe_timeout(),
            self.transcriber.transcribe(&media),
        )
        .await?;

        *stage = Stage::WritingResult;
        let result = TranscriptionResult::from_transcript(task, transcript);
        let location = within(Stage::WritingResult, self.limits.write_timeout(), async {
            self.results
                .put(&result)
                .await
                .map_err(|e| ProcessError::transient(Stage::WritingResult, e.to_string()))
        })
        .await?;

        *stage = Stage::Acknowledged;
        let done = self
            .store
            .transition_any(
                &task.guid,
                &[DispatchStatus::Dispatched, DispatchStatus::Processing],
                DispatchStatus::Done,
            )
            .map_err(|e| ProcessError::transient(Stage::Acknowledged, e.to_string()))?;

        if !done {
            // Swept and re-offered while we worked; the re-run overwrites the same key
            return Err(self.consistency(&task.guid));
        }

        Ok(location)
    }

    /// Take ownership of the guid: `dispatched → processing`
    fn claim(&self, task: &ProcessingTask) -> Result<(), ProcessError> {
        let record = self
            .store
            .get(&task.guid)
            .map_err(|e| ProcessError::transient(Stage::Received, e.to_string()))?;

        let Some(record) = record else {
            warn!("No dispatch record for task");
            return Err(ProcessError::Consistency {
                guid: task.guid.clone(),
                found: None,
            });
        };

        let claimed = self
            .store
            .transition(&task.guid, DispatchStatus::Dispatched, DispatchStatus::Processing)
            .map_err(|e| ProcessError::transient(Stage::Received, e.to_string()))?;

        if !claimed {
            return Err(ProcessError::Consistency {
                guid: task.guid.clone(),
                found: Some(record.status),
            });
        }

        debug!(attempt_count = record.attempt_count, "Task claimed");
        Ok(())
    }

    fn consistency(&self, guid: &str) -> ProcessError {
        let found = self.store.get(guid).ok().flatten().map(|r| r.status);
        ProcessError::Consistency {
            guid: guid.to_string(),
            found,
        }
    }

    /// Turn a classified failure into a record change and an outcome
    fn handle_failure(&self, task: &ProcessingTask, error: ProcessError) -> TaskOutcome {
        let message = error.to_string();

        let failure = match &error {
            ProcessError::Consistency { found, .. } => {
                info!(?found, "Guid handled elsewhere, acknowledging");
                return TaskOutcome::Duplicate;
            }
            ProcessError::Transient { .. } if !self.limits.is_final_delivery(task.delivery_attempt) => {
                warn!(stage = %error.stage(), error = %message, "Transient failure, requesting redelivery");
                match self
                    .store
                    .transition(&task.guid, DispatchStatus::Processing, DispatchStatus::Dispatched)
                {
                    Ok(true) => {}
                    Ok(false) => debug!("Record was not in processing, leaving it"),
                    Err(e) => warn!(error = %e, "Failed to release claim"),
                }
                return TaskOutcome::Retry { error: message };
            }
            ProcessError::Transient { .. } => FailureKind::TransientExhausted,
            ProcessError::Permanent { .. } => FailureKind::Permanent,
        };

        match self
            .store
            .fail(&task.guid, DispatchStatus::Processing, failure, &message)
        {
            Ok(true) => {}
            Ok(false) => debug!("Record was not in processing, failure not recorded"),
            Err(e) => {
                // Keep the task alive so the failure can be recorded on redelivery
                warn!(error = %e, "Failed to record failure");
                return TaskOutcome::Retry { error: message };
            }
        }

        error!(
            alert = true,
            stage = %error.stage(),
            failure = %failure,
            error = %message,
            "Episode processing failed"
        );

        TaskOutcome::Failed { error: message }
    }
}

#[async_trait]
impl TaskHandler for Worker {
    async fn handle(&self, task: ProcessingTask) -> TaskOutcome {
        self.process(task).await
    }
}

/// Run a stage future under its timeout
async fn within<T, F>(stage: Stage, limit: Duration, fut: F) -> Result<T, ProcessError>
where
    F: Future<Output = Result<T, ProcessError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProcessError::transient(
            stage,
            format!("timed out after {}s", limit.as_secs()),
        )),
    }
}
