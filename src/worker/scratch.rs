//! Per-task scratch directories with a shared disk budget.
//!
//! Every task gets its own `task-*` directory under the scratch root. Bytes
//! are reserved against the budget before they are written; the directory
//! and its reservation are released when the [`TaskScratch`] guard drops,
//! whichever way the task ends.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ScratchError {
    #[error("scratch budget exhausted: requested {requested} bytes, {available} available")]
    Exhausted { requested: u64, available: u64 },

    #[error("scratch I/O error: {0}")]
    Io(#[from] std::io::Error),
}

struct Inner {
    root: PathBuf,
    budget: u64,
    used: AtomicU64,
}

/// Scratch root shared by all tasks of a worker
#[derive(Clone)]
pub struct ScratchSpace {
    inner: Arc<Inner>,
}

impl ScratchSpace {
    /// Create the scratch root if needed
    pub fn new(root: impl Into<PathBuf>, budget: u64) -> Result<Self, ScratchError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        Ok(Self {
            inner: Arc::new(Inner {
                root,
                budget,
                used: AtomicU64::new(0),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn budget(&self) -> u64 {
        self.inner.budget
    }

    /// Bytes currently reserved by live tasks
    pub fn used(&self) -> u64 {
        self.inner.used.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> u64 {
        self.budget().saturating_sub(self.used())
    }

    /// Create a fresh directory for one task
    pub fn allocate(&self) -> Result<TaskScratch, ScratchError> {
        let dir = tempfile::Builder::new()
            .prefix("task-")
            .tempdir_in(&self.inner.root)?;

        Ok(TaskScratch {
            dir,
            reserved: 0,
            space: self.inner.clone(),
        })
    }

    /// Remove `task-*` directories last modified before `older_than` ago.
    ///
    /// Left behind by workers that were killed mid-task. Returns the number
    /// of directories removed.
    pub fn purge_orphans(&self, older_than: Duration) -> Result<usize, ScratchError> {
        let pattern = self.inner.root.join("task-*");
        let pattern = pattern.to_string_lossy();
        let cutoff = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0;
        let entries = glob::glob(&pattern).map_err(|e| {
            ScratchError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;

        for path in entries.flatten() {
            let modified = match path.metadata().and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Cannot stat scratch entry");
                    continue;
                }
            };

            if !path.is_dir() || modified > cutoff {
                continue;
            }

            match std::fs::remove_dir_all(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to purge orphaned scratch dir"),
            }
        }

        if removed > 0 {
            info!(removed, "Purged orphaned scratch directories");
        }

        Ok(removed)
    }
}

/// Scratch directory for one task (RAII)
pub struct TaskScratch {
    dir: TempDir,
    reserved: u64,
    space: Arc<Inner>,
}

impl TaskScratch {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Where to store the media for `url`, keeping its extension if it has one
    pub fn media_path(&self, url: &str) -> PathBuf {
        let name = url
            .split(['?', '#'])
            .next()
            .and_then(|path| path.rsplit('/').next())
            .and_then(|file| file.rsplit_once('.'))
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|ext| format!("media.{}", ext.to_ascii_lowercase()))
            .unwrap_or_else(|| "media".to_string());

        self.dir.path().join(name)
    }

    /// Bytes reserved by this task
    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    /// Grow this task's reservation to at least `total` bytes
    pub fn ensure_reserved(&mut self, total: u64) -> Result<(), ScratchError> {
        if total <= self.reserved {
            return Ok(());
        }

        let extra = total - self.reserved;
        let budget = self.space.budget;

        self.space
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(extra).filter(|next| *next <= budget)
            })
            .map_err(|used| ScratchError::Exhausted {
                requested: extra,
                available: budget.saturating_sub(used),
            })?;

        self.reserved = total;
        Ok(())
    }
}

impl Drop for TaskScratch {
    fn drop(&mut self) {
        self.space.used.fetch_sub(self.reserved, Ordering::SeqCst);
        // TempDir removes the directory itself
    }
}
