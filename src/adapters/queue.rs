//! Task queue boundary.
//!
//! The dispatcher only sees [`TaskQueue::submit`]. Delivery, redelivery,
//! backoff and dispatch concurrency belong to the queue:
//! - [`HttpTaskQueue`] posts tasks to a remote queue (or straight to a
//!   worker endpoint) and treats its policy as opaque
//! - [`LocalQueue`] is an in-process queue for local runs and tests that
//!   implements that policy itself

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::retry::RetryPolicy;
use crate::domain::{ProcessingTask, TaskOutcome};

/// Errors returned by `submit`
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue rejected task {guid}: {reason}")]
    Rejected { guid: String, reason: String },

    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("queue is closed")]
    Closed,
}

impl QueueError {
    /// Whether resubmitting the same task could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Successful submit result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitReceipt {
    /// A new task was created
    Accepted,

    /// A live task with the same idempotency key already existed
    Duplicate,
}

/// Anything that accepts processing tasks
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Human-readable queue name
    fn name(&self) -> &str;

    /// Submit a task. Returns once the queue has durably accepted it.
    async fn submit(&self, task: &ProcessingTask) -> Result<SubmitReceipt, QueueError>;
}

/// Anything the queue can deliver tasks to
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: ProcessingTask) -> TaskOutcome;
}

/// Queue-side delivery policy.
///
/// For a remote queue these values only document what the queue is
/// configured with; `max_attempts` must match the worker's
/// `max_delivery_attempts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePolicy {
    /// Deliveries per task, including the first (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the first redelivery in milliseconds (default: 10s)
    #[serde(default = "default_min_backoff")]
    pub min_backoff_ms: u64,

    /// Backoff ceiling in milliseconds (default: 5 min)
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Tasks handed to workers at once (default: 1)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_dispatches: usize,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_min_backoff() -> u64 {
    10_000
}
fn default_max_backoff() -> u64 {
    300_000
}
fn default_max_concurrent() -> usize {
    1
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_backoff_ms: default_min_backoff(),
            max_backoff_ms: default_max_backoff(),
            max_concurrent_dispatches: default_max_concurrent(),
        }
    }
}

impl QueuePolicy {
    /// Redelivery schedule as a retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay_ms: self.min_backoff_ms,
            max_delay_ms: self.max_backoff_ms,
            backoff_multiplier: 2.0,
        }
    }
}

// ============================================================================
// HTTP queue
// ============================================================================

/// Submits tasks as JSON to an HTTP endpoint.
///
/// The guid travels as the `Idempotency-Key` header. 2xx means accepted,
/// 409 means the key is already live, other 4xx are rejections and
/// everything else is treated as the queue being unavailable.
pub struct HttpTaskQueue {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTaskQueue {
    /// Create a queue client with a per-request timeout
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, QueueError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QueueError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TaskQueue for HttpTaskQueue {
    fn name(&self) -> &str {
        "http"
    }

    async fn submit(&self, task: &ProcessingTask) -> Result<SubmitReceipt, QueueError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", task.idempotency_key())
            .header("x-delivery-attempt", task.delivery_attempt.to_string())
            .json(task)
            .send()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(SubmitReceipt::Accepted);
        }
        if status == reqwest::StatusCode::CONFLICT {
            return Ok(SubmitReceipt::Duplicate);
        }

        let body = response.text().await.unwrap_or_default();
        let reason = format!("HTTP {}: {}", status, body.trim());

        if status.is_client_error()
            && status != reqwest::StatusCode::REQUEST_TIMEOUT
            && status != reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            Err(QueueError::Rejected {
                guid: task.guid.clone(),
                reason,
            })
        } else {
            Err(QueueError::Unavailable(reason))
        }
    }
}

// ============================================================================
// Local in-process queue
// ============================================================================

/// Final state of one task in the local queue
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub guid: String,

    /// Deliveries made, including the first
    pub deliveries: u32,

    /// Outcome of the last delivery
    pub outcome: TaskOutcome,
}

/// In-process queue with at-least-once delivery.
///
/// Collapses submits whose guid is already live, limits concurrent
/// deliveries, and redelivers `Retry`/`Busy` outcomes with backoff until
/// `max_attempts` deliveries have been made.
pub struct LocalQueue {
    handler: Arc<dyn TaskHandler>,
    policy: QueuePolicy,
    permits: Arc<Semaphore>,
    live: Arc<Mutex<HashSet<String>>>,
    deliveries: Mutex<Vec<JoinHandle<DeliveryReport>>>,
}

impl LocalQueue {
    pub fn new(handler: Arc<dyn TaskHandler>, policy: QueuePolicy) -> Self {
        let permits = Arc::new(Semaphore::new(policy.max_concurrent_dispatches.max(1)));
        Self {
            handler,
            policy,
            permits,
            live: Arc::new(Mutex::new(HashSet::new())),
            deliveries: Mutex::new(Vec::new()),
        }
    }

    /// Number of tasks not yet acknowledged or abandoned
    pub fn in_flight(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Wait for every submitted task to finish and collect their reports
    pub async fn drain(&self) -> Vec<DeliveryReport> {
        let mut reports = Vec::new();

        loop {
            let handles = std::mem::take(
                &mut *self.deliveries.lock().unwrap_or_else(PoisonError::into_inner),
            );
            if handles.is_empty() {
                break;
            }

            for handle in handles {
                match handle.await {
                    Ok(report) => reports.push(report),
                    Err(e) => warn!(error = %e, "Delivery task panicked"),
                }
            }
        }

        reports
    }
}

#[async_trait]
impl TaskQueue for LocalQueue {
    fn name(&self) -> &str {
        "local"
    }

    async fn submit(&self, task: &ProcessingTask) -> Result<SubmitReceipt, QueueError> {
        if self.permits.is_closed() {
            return Err(QueueError::Closed);
        }

        {
            let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
            if !live.insert(task.idempotency_key().to_string()) {
                debug!(guid = %task.guid, "Task already live, collapsing duplicate submit");
                return Ok(SubmitReceipt::Duplicate);
            }
        }

        let handle = tokio::spawn(deliver(
            task.clone(),
            self.handler.clone(),
            self.policy.retry_policy(),
            self.permits.clone(),
            self.live.clone(),
        ));

        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);

        Ok(SubmitReceipt::Accepted)
    }
}

/// Deliver one task until it is acknowledged or the attempt budget is spent
async fn deliver(
    mut task: ProcessingTask,
    handler: Arc<dyn TaskHandler>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    live: Arc<Mutex<HashSet<String>>>,
) -> DeliveryReport {
    let outcome = loop {
        let outcome = match permits.acquire().await {
            Ok(_permit) => handler.handle(task.clone()).await,
            Err(_) => break TaskOutcome::Retry {
                error: "queue closed".to_string(),
            },
        };

        if outcome.is_ack() {
            break outcome;
        }

        if !retry.should_retry(task.delivery_attempt) {
            warn!(
                guid = %task.guid,
                deliveries = task.delivery_attempt,
                "Delivery attempts exhausted, abandoning task"
            );
            break outcome;
        }

        let delay = retry.delay_for_attempt(task.delivery_attempt);
        info!(
            guid = %task.guid,
            delivery_attempt = task.delivery_attempt,
            delay_ms = delay.as_millis() as u64,
            "Redelivering task"
        );
        tokio::time::sleep(delay).await;
        task = task.redelivered();
    };

    live.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(task.idempotency_key());

    DeliveryReport {
        guid: task.guid,
        deliveries: task.delivery_attempt,
        outcome,
    }
}
