//! Queue messages and worker outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::DispatchRecord;

/// A unit of work handed to the task queue.
///
/// Only `guid` and `media_url` are required on the wire so that a bare
/// `{guid, media_url}` payload posted to the worker endpoint is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTask {
    /// Unique message id
    #[serde(default = "new_task_id")]
    pub task_id: Uuid,

    /// Episode guid (also the queue idempotency key)
    pub guid: String,

    /// Media to download and transcribe
    pub media_url: String,

    /// Episode title, carried into the result document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_date: Option<DateTime<Utc>>,

    /// When the dispatcher submitted the task
    #[serde(default = "Utc::now")]
    pub enqueued_at: DateTime<Utc>,

    /// 1 on first delivery, incremented by the queue on each redelivery
    #[serde(default = "first_delivery")]
    pub delivery_attempt: u32,

    /// Correlates worker logs with the poll cycle that dispatched the task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

fn new_task_id() -> Uuid {
    Uuid::new_v4()
}

fn first_delivery() -> u32 {
    1
}

impl ProcessingTask {
    /// Build the task for a record that was just moved to `dispatched`
    pub fn for_record(record: &DispatchRecord, trace_id: Option<&str>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            guid: record.guid.clone(),
            media_url: record.media_url.clone(),
            title: record.title.clone(),
            description: record.description.clone(),
            publish_date: record.publish_date,
            enqueued_at: Utc::now(),
            delivery_attempt: 1,
            trace_id: trace_id.map(str::to_string),
        }
    }

    /// Queue-side dedup key
    pub fn idempotency_key(&self) -> &str {
        &self.guid
    }

    /// The same task as seen on its next delivery
    pub fn redelivered(&self) -> Self {
        Self {
            delivery_attempt: self.delivery_attempt + 1,
            ..self.clone()
        }
    }
}

/// What the worker did with a delivery.
///
/// `Completed`, `Duplicate` and `Failed` acknowledge the task; `Retry` and
/// `Busy` ask the queue to redeliver it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TaskOutcome {
    /// Result stored and record marked done
    Completed,

    /// Someone else owns (or already finished) this guid
    Duplicate,

    /// Terminal failure recorded in the dedup store
    Failed { error: String },

    /// Transient failure; redeliver
    Retry { error: String },

    /// Admission limit reached; redeliver later
    Busy,
}

impl TaskOutcome {
    /// Whether the queue should stop delivering this task
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Completed | Self::Duplicate | Self::Failed { .. })
    }
}
