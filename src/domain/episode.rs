//! Episode candidates discovered in a feed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An episode seen in a feed during one poll cycle.
///
/// Candidates are never persisted as-is; the dispatcher turns the first
/// sighting of a guid into a [`DispatchRecord`](super::DispatchRecord).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeCandidate {
    /// Stable identifier from the feed (`<guid>`, falling back to link or title)
    pub guid: String,

    /// Episode title
    pub title: String,

    /// Episode description/summary
    #[serde(default)]
    pub description: Option<String>,

    /// Publication date, if the feed provides one
    #[serde(default)]
    pub publish_date: Option<DateTime<Utc>>,

    /// URL of the audio enclosure
    pub media_url: String,

    /// Title of the feed this episode came from
    #[serde(default)]
    pub feed_title: Option<String>,
}

impl EpisodeCandidate {
    /// Create a candidate with just the fields dispatch needs
    pub fn new(guid: impl Into<String>, title: impl Into<String>, media_url: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            title: title.into(),
            description: None,
            publish_date: None,
            media_url: media_url.into(),
            feed_title: None,
        }
    }
}
