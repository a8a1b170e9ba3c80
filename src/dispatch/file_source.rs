//! A work queue kept in a single JSON file.
//!
//! The file holds an array of records. Every write goes to a uniquely named
//! sibling temp file which is then renamed over the original, so a crash
//! mid-write never leaves a truncated queue behind.
//!
//! Read-modify-write cycles hold an exclusive advisory lock on a sidecar
//! `<queue>.lock` file, so `relay add` and a running `relay watch` can share
//! one queue without losing each other's writes.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::source::WorkSource;
use crate::error::RelayError;
use crate::model::{WorkItem, WorkStatus};

/// One queue entry as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRecord {
    #[serde(flatten)]
    pub item: WorkItem,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Number of records per status, in lifecycle order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

pub struct FileSource {
    path: PathBuf,
    // Serialises read-modify-write cycles from this process before the file
    // lock is taken, so waiting tasks do not tie up blocking threads.
    lock: Mutex<()>,
}

/// Exclusive lock on the queue's sidecar lock file, released on drop.
struct QueueLock {
    _file: File,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a new pending item. Ids must be unique within the file.
    pub async fn enqueue(&self, item: WorkItem) -> Result<(), RelayError> {
        let _guard = self.lock.lock().await;
        let _file_lock = self.lock_exclusive().await?;
        let mut records = self.load().await?;
        if records.iter().any(|r| r.item.id == item.id) {
            return Err(RelayError::DuplicateItem(item.id));
        }
        info!(item_id = %item.id, priority = %item.priority, "queued work item");
        records.push(QueueRecord {
            item,
            result_ref: None,
            updated_at: None,
        });
        self.store(&records).await
    }

    pub async fn records(&self) -> Result<Vec<QueueRecord>, RelayError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    pub async fn counts(&self) -> Result<QueueCounts, RelayError> {
        let mut counts = QueueCounts::default();
        for record in self.records().await? {
            match record.item.status {
                WorkStatus::Pending => counts.pending += 1,
                WorkStatus::Processing => counts.processing += 1,
                WorkStatus::Completed => counts.completed += 1,
                WorkStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn load(&self) -> Result<Vec<QueueRecord>, RelayError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(Vec::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, records: &[QueueRecord]) -> Result<(), RelayError> {
        let json = serde_json::to_vec_pretty(records)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &json))
            .await
            .map_err(|e| RelayError::Source(format!("queue write task failed: {e}")))?
    }

    /// Blocks (off the async runtime) until no other process is writing.
    async fn lock_exclusive(&self) -> Result<QueueLock, RelayError> {
        let lock_path = lock_path_for(&self.path);
        tokio::task::spawn_blocking(move || -> Result<QueueLock, RelayError> {
            std::fs::create_dir_all(parent_dir(&lock_path))?;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)?;
            FileExt::lock_exclusive(&file)?;
            Ok(QueueLock { _file: file })
        })
        .await
        .map_err(|e| RelayError::Source(format!("queue lock task failed: {e}")))?
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), RelayError> {
    let dir = parent_dir(path);
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl WorkSource for FileSource {
    async fn query_pending(&self) -> Result<Vec<WorkItem>, RelayError> {
        let records = self.records().await?;
        let mut pending: Vec<WorkItem> = records
            .into_iter()
            .map(|r| r.item)
            .filter(|item| item.status == WorkStatus::Pending)
            .collect();
        // Undated items go last; ties keep file order.
        pending.sort_by_key(|item| {
            (
                item.priority,
                item.created_at.unwrap_or(DateTime::<Utc>::MAX_UTC),
            )
        });
        debug!(count = pending.len(), "pending items in queue file");
        Ok(pending)
    }

    async fn update_status(
        &self,
        id: &str,
        status: WorkStatus,
        result_ref: Option<&str>,
    ) -> Result<(), RelayError> {
        let _guard = self.lock.lock().await;
        let _file_lock = self.lock_exclusive().await?;
        let mut records = self.load().await?;
        let record = records
            .iter_mut()
            .find(|r| r.item.id == id)
            .ok_or_else(|| RelayError::ItemNotFound(id.to_string()))?;
        record.item.status = status;
        if let Some(result_ref) = result_ref {
            record.result_ref = Some(result_ref.to_string());
        }
        record.updated_at = Some(Utc::now());
        self.store(&records).await?;
        info!(item_id = %id, %status, "status updated");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.records().await.is_ok()
    }
}
