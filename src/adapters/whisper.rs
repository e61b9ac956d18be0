//! Transcription backends.
//!
//! `WhisperTranscriber` shells out to a local whisper binary and reads its
//! JSON output. `FakeTranscriber` answers instantly for local development
//! and tests.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::domain::{ModelMetadata, Segment, Transcript};
use crate::error::{ProcessError, Stage};

use super::Transcriber;

/// Whisper output JSON structure
#[derive(Debug, Deserialize)]
struct WhisperOutput {
    #[serde(default)]
    language: String,
    #[serde(default)]
    language_probability: Option<f64>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
    #[serde(default)]
    text: String,
}

/// Local whisper CLI
pub struct WhisperTranscriber {
    binary: PathBuf,
    model: String,
    language: String,
    device: Option<String>,
}

impl WhisperTranscriber {
    pub fn new(binary: impl Into<PathBuf>, model: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            model: model.into(),
            language: language.into(),
            device: None,
        }
    }

    /// Run on a specific device (e.g. "cuda", "cpu")
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    fn name(&self) -> &str {
        "whisper"
    }

    #[instrument(skip(self), fields(model = %self.model))]
    async fn transcribe(&self, media: &Path) -> Result<Transcript, ProcessError> {
        // Output lands in the task's scratch dir and is cleaned up with it
        let output_dir = media
            .parent()
            .map(|dir| dir.join("whisper"))
            .unwrap_or_else(|| PathBuf::from("whisper"));
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| ProcessError::transient(Stage::Transcribing, format!("cannot create output dir: {}", e)))?;

        let mut command = Command::new(&self.binary);
        command
            .arg(media)
            .arg("--model")
            .arg(&self.model)
            .arg("--language")
            .arg(&self.language)
            .arg("--output_dir")
            .arg(&output_dir)
            .arg("--output_format")
            .arg("json")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Stage timeouts drop this future; the child must die with it
            .kill_on_drop(true);

        if let Some(device) = &self.device {
            command.arg("--device").arg(device);
        }

        let output = command.output().await.map_err(|e| {
            ProcessError::transient(
                Stage::Transcribing,
                format!("failed to run {}: {}", self.binary.display(), e),
            )
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(output.status.code(), &stderr));
        }

        let stem = media.file_stem().unwrap_or_default().to_string_lossy();
        let json_path = output_dir.join(format!("{}.json", stem));

        let content = tokio::fs::read_to_string(&json_path)
            .await
            .map_err(|e| ProcessError::transient(Stage::Transcribing, format!("failed to read whisper output: {}", e)))?;

        let transcript = parse_output(&content, &self.model, &self.language)?;
        debug!(segments = transcript.segments.len(), "Transcription finished");
        Ok(transcript)
    }
}

/// Turn whisper's JSON output into a transcript
fn parse_output(content: &str, model: &str, default_language: &str) -> Result<Transcript, ProcessError> {
    let whisper: WhisperOutput = serde_json::from_str(content)
        .map_err(|e| ProcessError::permanent(Stage::Transcribing, format!("failed to parse whisper JSON: {}", e)))?;

    let duration = whisper
        .duration
        .unwrap_or_else(|| whisper.segments.last().map(|s| s.end).unwrap_or(0.0));

    let segments = whisper
        .segments
        .into_iter()
        .map(|s| Segment {
            start_time: s.start,
            end_time: s.end,
            text: s.text.trim().to_string(),
        })
        .collect();

    Ok(Transcript {
        segments,
        metadata: ModelMetadata {
            model: model.to_string(),
            language: if whisper.language.is_empty() {
                default_language.to_string()
            } else {
                whisper.language
            },
            language_probability: whisper.language_probability,
            duration_seconds: duration,
        },
    })
}

/// Classify a failed whisper run.
///
/// Killed by a signal or out of (GPU) memory is worth another delivery;
/// anything else means the media itself is the problem.
pub fn classify_failure(exit_code: Option<i32>, stderr: &str) -> ProcessError {
    let lower = stderr.to_lowercase();
    let trimmed = stderr.trim();
    let start = trimmed.char_indices().rev().nth(499).map(|(i, _)| i).unwrap_or(0);
    let tail = &trimmed[start..];

    let Some(code) = exit_code else {
        return ProcessError::transient(Stage::Transcribing, format!("whisper killed by signal: {}", tail));
    };

    let resource_exhausted = ["out of memory", "cuda error", "cudnn", "resource exhausted"]
        .iter()
        .any(|needle| lower.contains(needle));

    if resource_exhausted {
        ProcessError::transient(Stage::Transcribing, format!("whisper ran out of resources (exit {}): {}", code, tail))
    } else {
        ProcessError::permanent(Stage::Transcribing, format!("whisper failed (exit {}): {}", code, tail))
    }
}

/// Instant fake transcriber for local development and tests
#[derive(Debug, Default, Clone)]
pub struct FakeTranscriber;

impl FakeTranscriber {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    fn name(&self) -> &str {
        "fake"
    }

    async fn transcribe(&self, media: &Path) -> Result<Transcript, ProcessError> {
        let size = tokio::fs::metadata(media)
            .await
            .map_err(|e| ProcessError::transient(Stage::Transcribing, format!("cannot stat media: {}", e)))?
            .len();

        if size == 0 {
            return Err(ProcessError::permanent(Stage::Transcribing, "unsupported media: empty file"));
        }

        Ok(Transcript {
            segments: vec![Segment {
                start_time: 0.0,
                end_time: 120.0,
                text: format!("[FAKE TRANSCRIPTION] size={}", size),
            }],
            metadata: ModelMetadata {
                model: "fake".to_string(),
                language: "sv".to_string(),
                language_probability: Some(0.99),
                duration_seconds: 120.0,
            },
        })
    }
}
