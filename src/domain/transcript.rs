//! Transcription output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::ProcessingTask;

/// One timed piece of transcript text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Start offset in seconds
    pub start_time: f64,

    /// End offset in seconds
    pub end_time: f64,

    pub text: String,
}

/// Which model produced the transcript and what it detected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Model identifier (e.g. "large-v3", "fake")
    pub model: String,

    /// Detected or forced language
    pub language: String,

    /// Language detection confidence, if the backend reports it
    #[serde(default)]
    pub language_probability: Option<f64>,

    /// Audio duration in seconds
    pub duration_seconds: f64,
}

/// Raw transcriber output, before it is tied to an episode
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub segments: Vec<Segment>,
    pub metadata: ModelMetadata,
}

/// Episode fields copied into the stored document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeInfo {
    pub guid: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub pub_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: Option<String>,
    pub media_url: String,
}

/// The stored result for one guid. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    /// Episode guid (Result Store key)
    pub guid: String,

    pub episode: EpisodeInfo,

    /// Ordered by start time
    pub segments: Vec<Segment>,

    /// Segment texts joined with single spaces
    pub full_text: String,

    pub model: ModelMetadata,

    pub created_at: DateTime<Utc>,
}

impl TranscriptionResult {
    /// Attach a transcript to the task it was produced for
    pub fn from_transcript(task: &ProcessingTask, transcript: Transcript) -> Self {
        let mut segments = transcript.segments;
        segments.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));

        let full_text = segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            guid: task.guid.clone(),
            episode: EpisodeInfo {
                guid: task.guid.clone(),
                title: task.title.clone(),
                pub_date: task.publish_date,
                description: task.description.clone(),
                media_url: task.media_url.clone(),
            },
            segments,
            full_text,
            model: transcript.metadata,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(start: f64, end: f64, text: &str) -> Segment {
        Segment {
            start_time: start,
            end_time: end,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_full_text_joins_ordered_segments() {
        let task: ProcessingTask =
            serde_json::from_str(r#"{"guid":"ep-1","media_url":"https://x/ep1.mp3"}"#).unwrap();
        let transcript = Transcript {
            segments: vec![
                segment(4.0, 8.0, " world "),
                segment(0.0, 4.0, "hello"),
                segment(8.0, 9.0, "  "),
            ],
            metadata: ModelMetadata {
                model: "fake".to_string(),
                language: "sv".to_string(),
                language_probability: None,
                duration_seconds: 9.0,
            },
        };

        let result = TranscriptionResult::from_transcript(&task, transcript);

        assert_eq!(result.full_text, "hello world");
        assert_eq!(result.segments[0].start_time, 0.0);
        assert_eq!(result.episode.media_url, "https://x/ep1.mp3");
    }
}
