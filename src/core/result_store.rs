//! Durable transcription output keyed by guid.
//!
//! Writes go to a temporary file and are renamed into place, so a reader
//! never sees a half-written document and a redelivered task can overwrite
//! the same key safely.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::domain::TranscriptionResult;
use crate::error::StoreError;

/// Storage for transcription results
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Store (or overwrite) the result for its guid. Returns its location.
    async fn put(&self, result: &TranscriptionResult) -> Result<String, StoreError>;

    /// Load the result for a guid
    async fn get(&self, guid: &str) -> Result<Option<TranscriptionResult>, StoreError>;

    /// Whether a result exists for a guid
    async fn contains(&self, guid: &str) -> Result<bool, StoreError> {
        Ok(self.get(guid).await?.is_some())
    }
}

/// Results stored as pretty JSON files in a local directory
pub struct LocalResultStore {
    dir: PathBuf,
}

impl LocalResultStore {
    /// Open the store, creating the directory if needed
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Directory holding the results
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path for a guid
    pub fn path_for(&self, guid: &str) -> PathBuf {
        self.dir.join(format!("{}.json", result_key(guid)))
    }

    /// Number of stored results
    pub async fn len(&self) -> Result<usize, StoreError> {
        let mut count = 0;
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                count += 1;
            }
        }

        Ok(count)
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }
}

#[async_trait]
impl ResultStore for LocalResultStore {
    async fn put(&self, result: &TranscriptionResult) -> Result<String, StoreError> {
        let path = self.path_for(&result.guid);
        let staging = self
            .dir
            .join(format!(".{}.{}.tmp", result_key(&result.guid), Uuid::new_v4().simple()));

        let json = serde_json::to_vec_pretty(result)?;
        fs::write(&staging, json).await?;

        if let Err(e) = fs::rename(&staging, &path).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }

        Ok(path.display().to_string())
    }

    async fn get(&self, guid: &str) -> Result<Option<TranscriptionResult>, StoreError> {
        let path = self.path_for(guid);

        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(serde_json::from_slice(&content)?))
    }
}

/// Filesystem-safe key for a guid (first 32 hex chars of SHA256)
pub fn result_key(guid: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(guid.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}
