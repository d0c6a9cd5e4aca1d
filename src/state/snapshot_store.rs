use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::market_data::types::{QuoteRecord, Snapshot};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("snapshot i/o failed: {0}")]
    Io(String),

    #[error("snapshot document is corrupt: {0}")]
    Corrupt(String),

    #[error("failed to encode snapshot: {0}")]
    Encode(String),
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Holder of the single current snapshot.
///
/// `replace_all` either installs a complete new generation or fails with the
/// previous one untouched. `read_all` never observes anything in between.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn replace_all(&self, records: Vec<QuoteRecord>) -> Result<Arc<Snapshot>, StoreError>;

    async fn read_all(&self) -> Result<Arc<Snapshot>, StoreError>;
}

/// Process-local store: the snapshot lives behind one `Arc` that commits swap.
pub struct MemorySnapshotStore {
    current: RwLock<Arc<Snapshot>>,
    // Serializes writers so generations are handed out in order.
    commit: Mutex<()>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::with_snapshot(Snapshot::empty())
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            commit: Mutex::new(()),
        }
    }

    /// Builds the next generation without publishing it. Callers must hold
    /// the commit lock.
    async fn stage(&self, records: Vec<QuoteRecord>) -> Arc<Snapshot> {
        let generation = self.current.read().await.generation() + 1;
        Arc::new(Snapshot::new(generation, SystemTime::now(), records))
    }

    async fn publish(&self, next: Arc<Snapshot>) {
        *self.current.write().await = next;
    }
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn replace_all(&self, records: Vec<QuoteRecord>) -> Result<Arc<Snapshot>, StoreError> {
        let _guard = self.commit.lock().await;
        let next = self.stage(records).await;
        self.publish(next.clone()).await;
        Ok(next)
    }

    async fn read_all(&self) -> Result<Arc<Snapshot>, StoreError> {
        Ok(self.current.read().await.clone())
    }
}

/// On-disk form of a snapshot.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SnapshotDocument {
    generation: u64,
    fetched_at: SystemTime,
    quotes: Vec<QuoteRecord>,
}

/// Durable store backed by a single JSON document.
///
/// A commit writes the full document to a sibling temp file, syncs it and
/// renames it over the target, then swaps the in-memory copy. A crash or an
/// i/o error at any point leaves the previous document and the previous
/// in-memory snapshot in place.
pub struct FileSnapshotStore {
    path: PathBuf,
    tmp_path: PathBuf,
    cache: MemorySnapshotStore,
}

impl FileSnapshotStore {
    /// Opens the store, loading the last persisted snapshot if there is one.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let tmp_path = temp_path_for(&path)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let doc: SnapshotDocument = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
                Snapshot::new(doc.generation, doc.fetched_at, doc.quotes)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Snapshot::empty(),
            Err(e) => return Err(e.into()),
        };

        info!(
            path = %path.display(),
            generation = snapshot.generation(),
            quotes = snapshot.quotes().len(),
            "snapshot store opened"
        );

        Ok(Self {
            path,
            tmp_path,
            cache: MemorySnapshotStore::with_snapshot(snapshot),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let doc = SnapshotDocument {
            generation: snapshot.generation(),
            fetched_at: snapshot.fetched_at().unwrap_or_else(SystemTime::now),
            quotes: snapshot.quotes().to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&doc).map_err(|e| StoreError::Encode(e.to_string()))?;

        let written = self.write_temp(&bytes).await;
        let result = match written {
            Ok(()) => tokio::fs::rename(&self.tmp_path, &self.path)
                .await
                .map_err(StoreError::from),
            Err(e) => Err(e),
        };

        if result.is_err() {
            // Leftover temp file is harmless; the next commit truncates it.
            if let Err(e) = tokio::fs::remove_file(&self.tmp_path).await {
                debug!(error = %e, "temp snapshot cleanup skipped");
            }
        }
        result
    }

    async fn write_temp(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let mut file = tokio::fs::File::create(&self.tmp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn replace_all(&self, records: Vec<QuoteRecord>) -> Result<Arc<Snapshot>, StoreError> {
        let _guard = self.cache.commit.lock().await;
        let next = self.cache.stage(records).await;

        if let Err(e) = self.persist(&next).await {
            warn!(path = %self.path.display(), error = %e, "snapshot not persisted, keeping previous");
            return Err(e);
        }

        self.cache.publish(next.clone()).await;
        Ok(next)
    }

    async fn read_all(&self) -> Result<Arc<Snapshot>, StoreError> {
        self.cache.read_all().await
    }
}

fn temp_path_for(path: &Path) -> Result<PathBuf, StoreError> {
    let mut name = path
        .file_name()
        .ok_or_else(|| StoreError::Io(format!("{} has no file name", path.display())))?
        .to_os_string();
    name.push(".tmp");
    Ok(path.with_file_name(name))
}
