//! Audit trail of dispatch status changes.
//!
//! Every status change on a record appends one event. Events are never
//! updated or deleted, so the history of a guid can always be replayed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::DispatchStatus;

/// A single status change in the append-only history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchEvent {
    /// Monotonic sequence number assigned by the store
    pub seq: i64,

    /// The guid this event belongs to
    pub guid: String,

    /// Status before the change (`None` when the record was created)
    pub from: Option<DispatchStatus>,

    /// Status after the change
    pub to: DispatchStatus,

    /// Attempt count after the change
    pub attempt_count: u32,

    /// Human-readable note (error message, reason)
    pub note: Option<String>,

    /// When the change was recorded
    pub recorded_at: DateTime<Utc>,
}

impl DispatchEvent {
    /// Short "from → to" label for CLI output
    pub fn transition_label(&self) -> String {
        match self.from {
            Some(from) => format!("{} → {}", from, self.to),
            None => format!("created ({})", self.to),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_label() {
        let mut event = DispatchEvent {
            seq: 1,
            guid: "ep-1".to_string(),
            from: None,
            to: DispatchStatus::Pending,
            attempt_count: 0,
            note: None,
            recorded_at: Utc::now(),
        };
        assert_eq!(event.transition_label(), "created (pending)");

        event.from = Some(DispatchStatus::Pending);
        event.to = DispatchStatus::Dispatched;
        assert_eq!(event.transition_label(), "pending → dispatched");
    }
}
