//! Shared lifecycle layer for managed subprocesses.
//!
//! A [`ProcessTable`] tracks every spawned process: metadata, captured output
//! (bounded in-memory buffer plus an unconditional sidecar log file), a
//! completion notifier for cooperative blocking polls, and an incremental
//! read cursor. Status transitions are monotonic: `Running` moves to
//! `Completed` or `Failed` exactly once and never back.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::recovery::RecoveryRecord;
use super::ProcessError;

/// In-memory output cap per process; overflow goes to the sidecar file only.
pub const OUTPUT_MEMORY_CAP: usize = 1024 * 1024;

/// Marker appended once to in-memory output when the cap is exceeded.
pub const OUTPUT_LIMIT_MARKER: &str = "\n[Output limit reached]";

/// Window between a graceful terminate signal and the forceful kill.
pub const KILL_GRACE: Duration = Duration::from_millis(2_000);

/// Interval of the periodic garbage-collection sweep.
pub const GC_INTERVAL: Duration = Duration::from_secs(60);

/// Lifecycle state of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Completed,
    Failed,
}

/// Metadata for one managed process (background task or PTY session).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub id: String,
    pub command: String,
    pub cwd: PathBuf,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub max_runtime_ms: u64,
    pub output_file: PathBuf,
}

impl ProcessRecord {
    /// Create a fresh running record with a new unique id.
    pub fn spawn(command: &str, cwd: &Path, max_runtime_ms: u64, log_dir: &Path) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let output_file = log_dir.join(format!("{}.log", id));
        Self {
            id,
            command: command.to_string(),
            cwd: cwd.to_path_buf(),
            status: ProcessStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            max_runtime_ms,
            output_file,
        }
    }

    /// Wall-clock duration so far (or total, once ended), in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }

    fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == ProcessStatus::Running
            && (now - self.started_at).num_milliseconds().max(0) as u64 > self.max_runtime_ms
    }
}

/// Snapshot returned by a poll.
#[derive(Debug, Clone, Serialize)]
pub struct PollResult {
    pub id: String,
    pub status: ProcessStatus,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

/// Captured output: capped memory prefix plus a full sidecar file.
///
/// The in-memory buffer is always a byte-for-byte prefix of the sidecar file,
/// so cursor offsets are valid against either.
pub struct OutputBuffer {
    memory: Vec<u8>,
    total_written: u64,
    limit_hit: bool,
    sidecar_path: PathBuf,
    sidecar: Option<std::fs::File>,
}

impl OutputBuffer {
    /// Create the sidecar file and an empty buffer.
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let sidecar = std::fs::File::create(path)?;
        Ok(Self {
            memory: Vec::new(),
            total_written: 0,
            limit_hit: false,
            sidecar_path: path.to_path_buf(),
            sidecar: Some(sidecar),
        })
    }

    /// Buffer for a process recovered from a previous run: the sidecar file
    /// (if any) is left untouched and served read-only.
    pub fn recovered(path: &Path) -> Self {
        Self {
            memory: Vec::new(),
            total_written: 0,
            limit_hit: false,
            sidecar_path: path.to_path_buf(),
            sidecar: None,
        }
    }

    fn append(&mut self, data: &[u8]) {
        if let Some(ref mut file) = self.sidecar {
            if let Err(e) = file.write_all(data) {
                tracing::warn!(path = %self.sidecar_path.display(), error = %e,
                    "sidecar log write failed; only the in-memory prefix is retained, output past the cap is lost");
                self.sidecar = None;
            }
        }
        self.total_written += data.len() as u64;

        if self.memory.len() < OUTPUT_MEMORY_CAP {
            let room = OUTPUT_MEMORY_CAP - self.memory.len();
            self.memory.extend_from_slice(&data[..data.len().min(room)]);
        }
        if self.total_written as usize > OUTPUT_MEMORY_CAP && !self.limit_hit {
            self.limit_hit = true;
        }
    }

    /// Full output as text. Falls back to the sidecar file for recovered
    /// processes that never wrote to this buffer.
    fn snapshot_string(&self) -> String {
        if self.total_written == 0 && self.memory.is_empty() {
            if let Ok(content) = std::fs::read(&self.sidecar_path) {
                let end = content.len().min(OUTPUT_MEMORY_CAP);
                return String::from_utf8_lossy(&content[..end]).to_string();
            }
            return String::new();
        }
        let mut text = String::from_utf8_lossy(&self.memory).to_string();
        if self.limit_hit {
            text.push_str(OUTPUT_LIMIT_MARKER);
        }
        text
    }

    /// Read bytes from `offset` to the current end. Serves from memory when
    /// the range is still buffered, otherwise from the sidecar file.
    fn read_from(&self, offset: u64) -> Vec<u8> {
        if offset >= self.total_written {
            return Vec::new();
        }
        if offset < self.memory.len() as u64 && self.total_written as usize <= self.memory.len() {
            return self.memory[offset as usize..].to_vec();
        }
        match std::fs::File::open(&self.sidecar_path) {
            Ok(mut file) => {
                let mut data = Vec::new();
                if file.seek(SeekFrom::Start(offset)).is_ok()
                    && file.read_to_end(&mut data).is_ok()
                {
                    data
                } else {
                    Vec::new()
                }
            }
            Err(_) => {
                // Sidecar gone; serve what memory still covers.
                if offset < self.memory.len() as u64 {
                    self.memory[offset as usize..].to_vec()
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn len(&self) -> u64 {
        self.total_written
    }
}

struct EntryState {
    record: ProcessRecord,
    output: OutputBuffer,
    /// Incremental-read cursor; monotonic, never rewinds.
    cursor: u64,
}

struct Entry {
    state: Mutex<EntryState>,
    done: Notify,
}

/// Index of tracked processes shared by a manager and its spawned tasks.
///
/// The map mutex serializes index mutation (add/remove/lookup); per-entry
/// mutexes linearize operations on the same id while letting operations on
/// different ids proceed independently.
pub struct ProcessTable {
    entries: Mutex<HashMap<String, Arc<Entry>>>,
    capacity: usize,
}

impl ProcessTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Track a freshly spawned process. When the index is full, finished
    /// entries are garbage-collected first; if that frees nothing the insert
    /// fails with `CapacityExceeded`.
    pub async fn insert(&self, record: ProcessRecord) -> Result<(), ProcessError> {
        let output = OutputBuffer::create(&record.output_file)?;
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.capacity {
            Self::evict_finished_locked(&mut entries).await;
            if entries.len() >= self.capacity {
                return Err(ProcessError::CapacityExceeded {
                    limit: self.capacity,
                });
            }
        }
        entries.insert(
            record.id.clone(),
            Arc::new(Entry {
                state: Mutex::new(EntryState {
                    record,
                    output,
                    cursor: 0,
                }),
                done: Notify::new(),
            }),
        );
        Ok(())
    }

    /// Track an orphan recovered from the crash-recovery index. Orphans are
    /// already terminal, bypass the capacity check, and keep their old
    /// sidecar file readable.
    pub async fn insert_recovered(&self, record: ProcessRecord) {
        let output = OutputBuffer::recovered(&record.output_file);
        let mut entries = self.entries.lock().await;
        entries.insert(
            record.id.clone(),
            Arc::new(Entry {
                state: Mutex::new(EntryState {
                    record,
                    output,
                    cursor: 0,
                }),
                done: Notify::new(),
            }),
        );
    }

    async fn get(&self, id: &str) -> Result<Arc<Entry>, ProcessError> {
        self.entries
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ProcessError::NotFound(id.to_string()))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.lock().await.contains_key(id)
    }

    /// Append captured output for `id`. Unknown ids are ignored: the process
    /// may have been evicted while its pipe still had data in flight.
    pub async fn append_output(&self, id: &str, data: &[u8]) {
        if let Ok(entry) = self.get(id).await {
            entry.state.lock().await.output.append(data);
        }
    }

    /// Transition `id` out of `Running`. Monotonic: a second call (or a call
    /// on an already-terminal entry) is a no-op.
    pub async fn finish(&self, id: &str, status: ProcessStatus, exit_code: Option<i32>) {
        let entry = match self.get(id).await {
            Ok(entry) => entry,
            Err(_) => return,
        };
        {
            let mut state = entry.state.lock().await;
            if state.record.status != ProcessStatus::Running {
                return;
            }
            state.record.status = status;
            state.record.exit_code = exit_code;
            state.record.ended_at = Some(Utc::now());
        }
        entry.done.notify_waiters();
    }

    pub async fn is_running(&self, id: &str) -> bool {
        match self.get(id).await {
            Ok(entry) => entry.state.lock().await.record.status == ProcessStatus::Running,
            Err(_) => false,
        }
    }

    /// Cooperatively wait until `id` leaves `Running` or `timeout` elapses.
    /// Returns either way; the caller re-reads the state afterwards.
    pub async fn wait_done(&self, id: &str, timeout: Duration) {
        let entry = match self.get(id).await {
            Ok(entry) => entry,
            Err(_) => return,
        };
        let deadline = Instant::now() + timeout;
        loop {
            // Register before checking status so a wakeup between the check
            // and the await is not lost.
            let notified = entry.done.notified();
            if entry.state.lock().await.record.status != ProcessStatus::Running {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    /// Current record and full output for `id`.
    pub async fn poll_result(&self, id: &str) -> Result<PollResult, ProcessError> {
        let entry = self.get(id).await?;
        let state = entry.state.lock().await;
        Ok(PollResult {
            id: state.record.id.clone(),
            status: state.record.status,
            output: state.output.snapshot_string(),
            exit_code: state.record.exit_code,
            duration_ms: state.record.duration_ms(),
        })
    }

    /// Output delta since the last incremental read; advances the cursor.
    pub async fn read_incremental(&self, id: &str) -> Result<String, ProcessError> {
        let entry = self.get(id).await?;
        let mut state = entry.state.lock().await;
        let data = state.output.read_from(state.cursor);
        state.cursor = state.output.len();
        Ok(String::from_utf8_lossy(&data).to_string())
    }

    pub async fn record(&self, id: &str) -> Result<ProcessRecord, ProcessError> {
        let entry = self.get(id).await?;
        let record = entry.state.lock().await.record.clone();
        Ok(record)
    }

    /// Snapshot of all tracked records (running and not yet evicted).
    pub async fn list(&self) -> Vec<ProcessRecord> {
        let entries: Vec<Arc<Entry>> = self.entries.lock().await.values().cloned().collect();
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push(entry.state.lock().await.record.clone());
        }
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        records
    }

    /// Rewrite an entry's max runtime so expiry can be forced in tests.
    #[cfg(test)]
    pub(crate) async fn set_max_runtime(
        &self,
        id: &str,
        max_runtime_ms: u64,
    ) -> Result<(), ProcessError> {
        let entry = self.get(id).await?;
        entry.state.lock().await.record.max_runtime_ms = max_runtime_ms;
        Ok(())
    }

    /// Ids of running entries that exceeded their max runtime.
    pub async fn overdue_ids(&self) -> Vec<String> {
        let now = Utc::now();
        let mut ids = Vec::new();
        for record in self.list().await {
            if record.is_overdue(now) {
                ids.push(record.id);
            }
        }
        ids
    }

    /// Evict every finished entry from the index. Sidecar log files are
    /// retained on disk. Returns the number of entries removed.
    pub async fn evict_finished(&self) -> usize {
        let mut entries = self.entries.lock().await;
        Self::evict_finished_locked(&mut entries).await
    }

    async fn evict_finished_locked(entries: &mut HashMap<String, Arc<Entry>>) -> usize {
        let mut finished = Vec::new();
        for (id, entry) in entries.iter() {
            if entry.state.lock().await.record.status != ProcessStatus::Running {
                finished.push(id.clone());
            }
        }
        for id in &finished {
            entries.remove(id);
            tracing::debug!(task_id = %id, "evicted finished task from index");
        }
        finished.len()
    }

    /// Recovery-index records for every currently running entry.
    pub async fn snapshot_running(&self) -> Vec<RecoveryRecord> {
        self.list()
            .await
            .into_iter()
            .filter(|r| r.status == ProcessStatus::Running)
            .map(RecoveryRecord::from_record)
            .collect()
    }
}

/// Send a Unix signal to `pid`. Errors (already-exited process) are ignored;
/// the waiter task observes the actual exit.
pub fn send_signal(pid: u32, signal: i32) {
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}
