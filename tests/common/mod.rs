//! Shared fakes for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use podscribe::adapters::{Downloader, FakeTranscriber, QueueError, SubmitReceipt, TaskQueue};
use podscribe::core::{DispatchPolicy, Dispatcher, LocalResultStore, RetryPolicy, SqliteDedupStore, WorkerLimits};
use podscribe::domain::{EpisodeCandidate, ProcessingTask};
use podscribe::error::{ProcessError, Stage};
use podscribe::worker::{ScratchSpace, TaskScratch, Worker};

pub fn candidate(guid: &str) -> EpisodeCandidate {
    EpisodeCandidate::new(guid, format!("Episode {}", guid), format!("https://cdn.example.com/{}.mp3", guid))
}

/// Dispatch policy that never sleeps
pub fn fast_policy() -> DispatchPolicy {
    DispatchPolicy {
        enqueue_retry: RetryPolicy::immediate(3),
        ..Default::default()
    }
}

// ============================================================================
// Queue
// ============================================================================

/// What the recording queue does on each submit
#[derive(Debug, Clone)]
pub enum SubmitBehavior {
    Accept,
    Unavailable,
    Reject,
}

/// Records submitted tasks without delivering them
#[derive(Default)]
pub struct RecordingQueue {
    submitted: Mutex<Vec<ProcessingTask>>,
    script: Mutex<VecDeque<SubmitBehavior>>,
    fallback: Mutex<Option<SubmitBehavior>>,
    calls: AtomicUsize,
}

impl RecordingQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Behave per `script` for the next submits, then accept
    pub fn scripted(script: Vec<SubmitBehavior>) -> Arc<Self> {
        let queue = Self::default();
        *queue.script.lock().unwrap() = script.into();
        Arc::new(queue)
    }

    /// Behave the same way on every submit
    pub fn always(behavior: SubmitBehavior) -> Arc<Self> {
        let queue = Self::default();
        *queue.fallback.lock().unwrap() = Some(behavior);
        Arc::new(queue)
    }

    pub fn set_always(&self, behavior: SubmitBehavior) {
        *self.fallback.lock().unwrap() = Some(behavior);
    }

    pub fn submitted(&self) -> Vec<ProcessingTask> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    fn name(&self) -> &str {
        "recording"
    }

    async fn submit(&self, task: &ProcessingTask) -> Result<SubmitReceipt, QueueError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.fallback.lock().unwrap().clone())
            .unwrap_or(SubmitBehavior::Accept);

        match behavior {
            SubmitBehavior::Accept => {
                self.submitted.lock().unwrap().push(task.clone());
                Ok(SubmitReceipt::Accepted)
            }
            SubmitBehavior::Unavailable => Err(QueueError::Unavailable("queue down".to_string())),
            SubmitBehavior::Reject => Err(QueueError::Rejected {
                guid: task.guid.clone(),
                reason: "payload too large".to_string(),
            }),
        }
    }
}

// ============================================================================
// Downloader
// ============================================================================

/// Per-call download behaviour
#[derive(Debug, Clone)]
pub enum Fetch {
    Bytes(Vec<u8>),
    Transient,
    Permanent,
    /// Wait for `ScriptedDownloader::release`, then return bytes
    Gated,
    /// Sleep, then return bytes
    Slow(Duration),
}

/// Downloader that follows a script and then returns `fallback`
pub struct ScriptedDownloader {
    script: Mutex<VecDeque<Fetch>>,
    fallback: Fetch,
    calls: AtomicUsize,
    gate: Notify,
    entered: Notify,
}

impl ScriptedDownloader {
    pub fn new(script: Vec<Fetch>, fallback: Fetch) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
            gate: Notify::new(),
            entered: Notify::new(),
        })
    }

    /// Always succeeds with a small payload
    pub fn ok() -> Arc<Self> {
        Self::new(Vec::new(), Fetch::Bytes(b"ID3 fake audio".to_vec()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Wait until a gated download has started
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    /// Let a gated download finish
    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl Downloader for ScriptedDownloader {
    async fn download(&self, url: &str, scratch: &mut TaskScratch) -> Result<PathBuf, ProcessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front().unwrap_or_else(|| self.fallback.clone());

        let bytes = match step {
            Fetch::Bytes(bytes) => bytes,
            Fetch::Transient => return Err(ProcessError::transient(Stage::Downloading, "HTTP 503")),
            Fetch::Permanent => return Err(ProcessError::permanent(Stage::Downloading, "HTTP 404")),
            Fetch::Gated => {
                self.entered.notify_one();
                self.gate.notified().await;
                b"gated audio".to_vec()
            }
            Fetch::Slow(delay) => {
                tokio::time::sleep(delay).await;
                b"slow audio".to_vec()
            }
        };

        scratch
            .ensure_reserved(bytes.len() as u64)
            .map_err(|e| ProcessError::transient(Stage::Downloading, e.to_string()))?;

        let path = scratch.media_path(url);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| ProcessError::transient(Stage::Downloading, e.to_string()))?;
        Ok(path)
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Store, results and scratch in one temp dir
pub struct Harness {
    pub temp: TempDir,
    pub store: Arc<SqliteDedupStore>,
    pub results: Arc<LocalResultStore>,
    pub scratch: ScratchSpace,
}

impl Harness {
    pub async fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SqliteDedupStore::open(&temp.path().join("dispatch.db")).unwrap());
        let results = Arc::new(LocalResultStore::open(temp.path().join("results")).await.unwrap());
        let scratch = ScratchSpace::new(temp.path().join("scratch"), 1024 * 1024).unwrap();

        Self {
            temp,
            store,
            results,
            scratch,
        }
    }

    pub fn dispatcher(&self, queue: Arc<dyn TaskQueue>, policy: DispatchPolicy) -> Dispatcher {
        Dispatcher::new(self.store.clone(), queue, self.results.clone(), policy)
    }

    pub fn worker(&self, downloader: Arc<dyn Downloader>, limits: WorkerLimits) -> Arc<Worker> {
        Arc::new(Worker::new(
            self.store.clone(),
            self.results.clone(),
            downloader,
            Arc::new(FakeTranscriber::new()),
            self.scratch.clone(),
            limits,
        ))
    }

    /// Number of task-* directories left in scratch
    pub fn scratch_dirs(&self) -> usize {
        std::fs::read_dir(self.scratch.root())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("task-"))
            .count()
    }
}

/// Worker limits small enough for tests
pub fn test_limits() -> WorkerLimits {
    WorkerLimits {
        max_scratch_bytes: 1024 * 1024,
        max_media_bytes: 512 * 1024,
        ..Default::default()
    }
}
