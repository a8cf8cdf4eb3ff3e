//! Crash-recovery index for managed processes.
//!
//! Each manager persists the metadata of its currently running processes to a
//! small JSON file. Writes are debounced: a state change schedules a flush,
//! and further changes within the window coalesce into the pending one. On a
//! cold start the index is loaded and every `running` entry is surfaced as
//! `failed` — the original OS process is gone and cannot be reattached, but
//! the caller still sees what was orphaned.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::lifecycle::{ProcessRecord, ProcessStatus, ProcessTable};

/// Delay between a state change and the index hitting disk.
const FLUSH_DEBOUNCE: Duration = Duration::from_millis(500);

/// One persisted index entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub id: String,
    pub command: String,
    pub cwd: PathBuf,
    pub started_at: DateTime<Utc>,
    pub output_file: PathBuf,
    pub status: ProcessStatus,
}

impl RecoveryRecord {
    pub fn from_record(record: ProcessRecord) -> Self {
        Self {
            id: record.id,
            command: record.command,
            cwd: record.cwd,
            started_at: record.started_at,
            output_file: record.output_file,
            status: record.status,
        }
    }

    /// Rehydrate into a process record marked failed (orphaned by a restart).
    pub fn into_orphan(self) -> ProcessRecord {
        ProcessRecord {
            id: self.id,
            command: self.command,
            cwd: self.cwd,
            status: ProcessStatus::Failed,
            started_at: self.started_at,
            ended_at: Some(Utc::now()),
            exit_code: None,
            max_runtime_ms: 0,
            output_file: self.output_file,
        }
    }
}

/// Debounced persistence of a [`ProcessTable`]'s running set.
pub struct RecoveryStore {
    path: PathBuf,
    table: Arc<ProcessTable>,
    pending: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RecoveryStore {
    pub fn new(path: impl Into<PathBuf>, table: Arc<ProcessTable>) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            table,
            pending: std::sync::Mutex::new(None),
        })
    }

    /// Load the previous run's index. Entries that were still `running` are
    /// returned as orphans (status `failed`); terminal entries are dropped.
    pub fn load_orphans(path: &Path) -> Vec<ProcessRecord> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => return Vec::new(),
        };
        let records: Vec<RecoveryRecord> = match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable recovery index, ignoring");
                return Vec::new();
            }
        };
        records
            .into_iter()
            .filter(|r| r.status == ProcessStatus::Running)
            .map(|r| {
                tracing::warn!(task_id = %r.id, command = %r.command,
                    "task orphaned by restart, marking failed");
                r.into_orphan()
            })
            .collect()
    }

    /// Schedule a flush. A request arriving while one is pending cancels and
    /// reschedules it, so bursts of state changes produce a single write.
    pub fn mark_dirty(self: &Arc<Self>) {
        let store = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(FLUSH_DEBOUNCE).await;
            store.flush_now().await;
        });
        let mut pending = self.pending.lock().unwrap();
        if let Some(previous) = pending.replace(handle) {
            previous.abort();
        }
    }

    /// Write the index immediately. Used by the debounce timer and by the
    /// shutdown path, which must complete before process exit.
    pub async fn flush_now(&self) {
        let snapshot = self.table.snapshot_running().await;
        if let Err(e) = self.write_snapshot(&snapshot) {
            tracing::error!(path = %self.path.display(), error = %e,
                "failed to persist crash-recovery index");
        }
    }

    fn write_snapshot(&self, snapshot: &[RecoveryRecord]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        // Write-then-rename so a crash mid-write never corrupts the index.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)
    }

    /// Cancel any pending debounce timer and flush synchronously.
    pub async fn shutdown(&self) {
        let handle = self.pending.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.flush_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn running_entries_come_back_as_failed_orphans() {
        let dir = TempDir::new().unwrap();
        let index_path = dir.path().join("tasks.json");

        let table = Arc::new(ProcessTable::new(10));
        let running = ProcessRecord::spawn("sleep 999", dir.path(), 60_000, dir.path());
        let finished = ProcessRecord::spawn("true", dir.path(), 60_000, dir.path());
        let running_id = running.id.clone();
        table.insert(running).await.unwrap();
        let finished_id = finished.id.clone();
        table.insert(finished).await.unwrap();
        table
            .finish(&finished_id, ProcessStatus::Completed, Some(0))
            .await;

        let store = RecoveryStore::new(&index_path, table);
        store.flush_now().await;

        let orphans = RecoveryStore::load_orphans(&index_path);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, running_id);
        assert_eq!(orphans[0].status, ProcessStatus::Failed);
        assert!(orphans[0].ended_at.is_some());
    }

    #[tokio::test]
    async fn missing_or_garbled_index_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.json");
        assert!(RecoveryStore::load_orphans(&path).is_empty());

        std::fs::write(&path, "not json at all").unwrap();
        assert!(RecoveryStore::load_orphans(&path).is_empty());
    }

    #[tokio::test]
    async fn debounced_writes_coalesce() {
        let dir = TempDir::new().unwrap();
        let index_path = dir.path().join("tasks.json");
        let table = Arc::new(ProcessTable::new(10));
        let record = ProcessRecord::spawn("sleep 1", dir.path(), 60_000, dir.path());
        table.insert(record).await.unwrap();

        let store = RecoveryStore::new(&index_path, table);
        for _ in 0..20 {
            store.mark_dirty();
        }
        assert!(!index_path.exists());
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(index_path.exists());
        let content = std::fs::read_to_string(&index_path).unwrap();
        let records: Vec<RecoveryRecord> = serde_json::from_str(&content).unwrap();
        assert_eq!(records.len(), 1);
    }
}
