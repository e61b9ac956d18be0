//! Configuration for podscribe.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (PODSCRIBE_HOME, PODSCRIBE_FAKE_MODE,
//!    PODSCRIBE_QUEUE_URL, PODSCRIBE_BIND, WHISPER_PATH)
//! 2. Config file (.podscribe/config.yaml)
//! 3. Defaults (~/.podscribe)
//!
//! Config file discovery:
//! - Searches current directory and parents for .podscribe/config.yaml
//! - `paths.home` is relative to the .podscribe/ directory; other paths are
//!   relative to the project root (the parent of .podscribe/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::queue::QueuePolicy;
use crate::core::dispatcher::DispatchPolicy;
use crate::core::limits::WorkerLimits;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Feed URLs polled every cycle
    #[serde(default)]
    pub feeds: Vec<String>,
    #[serde(default)]
    pub dispatch: DispatchPolicy,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub transcriber: TranscriberConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory holding dispatch.db (relative to .podscribe/)
    pub home: Option<String>,
    /// Result documents (relative to project root)
    pub results: Option<String>,
    /// Worker scratch space (relative to project root)
    pub scratch: Option<String>,
}

/// Which queue the dispatcher submits to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// In-process queue delivering straight to a local worker
    #[default]
    Local,
    /// Remote queue or worker endpoint reached over HTTP
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub kind: QueueKind,

    /// Endpoint for the HTTP queue
    #[serde(default)]
    pub url: Option<String>,

    /// Per-submit request timeout (default: 30s)
    #[serde(default = "default_submit_timeout")]
    pub submit_timeout_secs: u64,

    #[serde(flatten)]
    pub policy: QueuePolicy,
}

fn default_submit_timeout() -> u64 {
    30
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            kind: QueueKind::default(),
            url: None,
            submit_timeout_secs: default_submit_timeout(),
            policy: QueuePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Listen address for `podscribe serve`
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(flatten)]
    pub limits: WorkerLimits,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            limits: WorkerLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriberBackend {
    #[default]
    Whisper,
    /// Instant fake output, no model needed
    Fake,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriberConfig {
    #[serde(default)]
    pub backend: TranscriberBackend,
    #[serde(default = "default_whisper_binary")]
    pub binary: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// e.g. "cuda" or "cpu"; whisper picks when unset
    #[serde(default)]
    pub device: Option<String>,
}

fn default_whisper_binary() -> String {
    "whisper".to_string()
}
fn default_model() -> String {
    "large-v3".to_string()
}
fn default_language() -> String {
    "sv".to_string()
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            backend: TranscriberBackend::default(),
            binary: default_whisper_binary(),
            model: default_model(),
            language: default_language(),
            device: None,
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// State directory (dispatch.db, poll.lock)
    pub home: PathBuf,
    /// Result documents
    pub results_dir: PathBuf,
    /// Worker scratch root
    pub scratch_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub feeds: Vec<String>,
    pub dispatch: DispatchPolicy,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub transcriber: TranscriberConfig,
}

impl ResolvedConfig {
    /// Dedup store database
    pub fn db_path(&self) -> PathBuf {
        self.home.join("dispatch.db")
    }

    /// Lock file serialising poll cycles
    pub fn poll_lock_path(&self) -> PathBuf {
        self.home.join("poll.lock")
    }

    /// Whether transcription is faked
    pub fn fake_mode(&self) -> bool {
        self.transcriber.backend == TranscriberBackend::Fake
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".podscribe").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Combine an optional config file, defaults and environment overrides
fn resolve(
    file: Option<(PathBuf, ConfigFile)>,
    default_home: PathBuf,
    env: impl Fn(&str) -> Option<String>,
) -> ResolvedConfig {
    let (config_file, config) = match file {
        Some((path, config)) => (Some(path), config),
        None => (None, ConfigFile::default()),
    };

    let podscribe_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));
    let base_dir = podscribe_dir.parent().unwrap_or(Path::new("."));

    let home = match (env("PODSCRIBE_HOME"), &config.paths.home) {
        (Some(env_home), _) => PathBuf::from(env_home),
        (None, Some(home)) if config_file.is_some() => resolve_path(podscribe_dir, home),
        _ => default_home,
    };

    let results_dir = match &config.paths.results {
        Some(results) if config_file.is_some() => resolve_path(base_dir, results),
        _ => home.join("results"),
    };

    let scratch_dir = match &config.paths.scratch {
        Some(scratch) if config_file.is_some() => resolve_path(base_dir, scratch),
        _ => home.join("scratch"),
    };

    let mut queue = config.queue;
    if let Some(url) = env("PODSCRIBE_QUEUE_URL").filter(|u| !u.trim().is_empty()) {
        queue.kind = QueueKind::Http;
        queue.url = Some(url);
    }

    let mut worker = config.worker;
    if let Some(bind) = env("PODSCRIBE_BIND") {
        worker.bind = bind;
    }

    let mut transcriber = config.transcriber;
    if env("PODSCRIBE_FAKE_MODE").is_some_and(|v| is_truthy(&v)) {
        transcriber.backend = TranscriberBackend::Fake;
    }
    if let Some(binary) = env("WHISPER_PATH") {
        transcriber.binary = binary;
    }

    ResolvedConfig {
        home,
        results_dir,
        scratch_dir,
        config_file,
        feeds: config.feeds,
        dispatch: config.dispatch,
        queue,
        worker,
        transcriber,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    // Default home directory
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".podscribe");

    let file = match find_config_file() {
        Some(path) => {
            let config = load_config_file(&path)?;
            Some((path, config))
        }
        None => None,
    };

    Ok(resolve(file, default_home, |key| std::env::var(key).ok()))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}
