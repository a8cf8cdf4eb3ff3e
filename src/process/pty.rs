//! Interactive terminal sessions backed by a real PTY.
//!
//! Each session runs `/bin/sh` (optionally with an initial command) under a
//! pseudo-terminal from `portable-pty`. The blocking PTY reader and writer
//! live on `spawn_blocking` threads and bridge to the async side over
//! channels; captured output lands in the shared [`ProcessTable`] so polling
//! and incremental reads work the same way as for background tasks. A
//! periodic sweeper closes sessions that exceed their maximum lifetime.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, PtySize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::lifecycle::{
    send_signal, PollResult, ProcessRecord, ProcessStatus, ProcessTable, GC_INTERVAL, KILL_GRACE,
};
use super::recovery::RecoveryStore;
use super::ProcessError;

/// Default max runtime for a session when the caller sets none. Interactive
/// sessions are long-lived, but a forgotten one is still reaped eventually.
const SESSION_MAX_RUNTIME_MS: u64 = 24 * 60 * 60 * 1000;

enum PtyInput {
    Data(String),
    Resize { rows: u16, cols: u16 },
}

struct SessionHandle {
    input: mpsc::UnboundedSender<PtyInput>,
    killer: std::sync::Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
}

pub struct PtySessionManager {
    table: Arc<ProcessTable>,
    recovery: Arc<RecoveryStore>,
    handles: Mutex<HashMap<String, SessionHandle>>,
    log_dir: PathBuf,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PtySessionManager {
    /// Restore orphaned sessions from the recovery index, then start the
    /// periodic sweeper. A PTY cannot be reattached across a restart, so
    /// orphans only show up in `list` as failed.
    pub async fn new(
        log_dir: impl Into<PathBuf>,
        recovery_path: impl Into<PathBuf>,
        capacity: usize,
    ) -> Arc<Self> {
        let recovery_path = recovery_path.into();
        let table = Arc::new(ProcessTable::new(capacity));
        for orphan in RecoveryStore::load_orphans(&recovery_path) {
            table.insert_recovered(orphan).await;
        }
        let recovery = RecoveryStore::new(recovery_path, Arc::clone(&table));
        let manager = Arc::new(Self {
            table,
            recovery,
            handles: Mutex::new(HashMap::new()),
            log_dir: log_dir.into(),
            sweeper: std::sync::Mutex::new(None),
        });

        let sweep_target = Arc::clone(&manager);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GC_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sweep_target.sweep().await;
            }
        });
        *manager.sweeper.lock().unwrap() = Some(handle);
        manager
    }

    /// Open a session in `cwd`. An empty `command` gives a bare interactive
    /// shell; otherwise the shell runs the command and exits when it does.
    /// A session that outlives `max_runtime_ms` is closed by the watchdog.
    pub async fn open(
        self: &Arc<Self>,
        command: &str,
        cwd: &Path,
        rows: u16,
        cols: u16,
        max_runtime_ms: Option<u64>,
    ) -> Result<ProcessRecord, ProcessError> {
        let max_runtime_ms = max_runtime_ms.unwrap_or(SESSION_MAX_RUNTIME_MS);
        let label = if command.is_empty() { "/bin/sh" } else { command };
        let record = ProcessRecord::spawn(label, cwd, max_runtime_ms, &self.log_dir);
        let id = record.id.clone();
        self.table.insert(record.clone()).await?;

        let pty_system = native_pty_system();
        let pair = match pty_system.openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            Ok(pair) => pair,
            Err(e) => {
                self.table.finish(&id, ProcessStatus::Failed, None).await;
                return Err(ProcessError::Spawn(format!("failed to open pty: {}", e)));
            }
        };

        let mut cmd = CommandBuilder::new("/bin/sh");
        if !command.is_empty() {
            cmd.arg("-c");
            cmd.arg(command);
        }
        cmd.cwd(cwd);
        cmd.env("TERM", "xterm-256color");

        let mut child = match pair.slave.spawn_command(cmd) {
            Ok(child) => child,
            Err(e) => {
                self.table.finish(&id, ProcessStatus::Failed, None).await;
                return Err(ProcessError::Spawn(format!("failed to spawn shell: {}", e)));
            }
        };
        drop(pair.slave);

        let killer = child.clone_killer();
        let pid = child.process_id();
        tracing::info!(session_id = %id, command = %label, pid = ?pid, "terminal session opened");

        let mut reader = match pair.master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                let _ = child.kill();
                tokio::task::spawn_blocking(move || child.wait());
                self.table.finish(&id, ProcessStatus::Failed, None).await;
                return Err(ProcessError::Spawn(format!(
                    "failed to clone pty reader: {}",
                    e
                )));
            }
        };
        let master = pair.master;
        let mut writer = match master.take_writer() {
            Ok(writer) => writer,
            Err(e) => {
                let _ = child.kill();
                tokio::task::spawn_blocking(move || child.wait());
                self.table.finish(&id, ProcessStatus::Failed, None).await;
                return Err(ProcessError::Spawn(format!(
                    "failed to take pty writer: {}",
                    e
                )));
            }
        };

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<PtyInput>();
        let (output_tx, mut output_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        // Writer/resizer thread; owns the master so resize outlives the pair.
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            while let Some(msg) = input_rx.blocking_recv() {
                match msg {
                    PtyInput::Data(data) => {
                        if writer.write_all(data.as_bytes()).is_err() {
                            break;
                        }
                        let _ = writer.flush();
                    }
                    PtyInput::Resize { rows, cols } => {
                        let _ = master.resize(PtySize {
                            rows,
                            cols,
                            pixel_width: 0,
                            pixel_height: 0,
                        });
                    }
                }
            }
        });

        // Reader thread.
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            loop {
                use std::io::Read;
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if output_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Async pump from the reader thread into the table.
        let pump_table = Arc::clone(&self.table);
        let pump_id = id.clone();
        tokio::spawn(async move {
            while let Some(chunk) = output_rx.recv().await {
                pump_table.append_output(&pump_id, &chunk).await;
            }
        });

        // Reap on a blocking thread, record the exit on the async side.
        let wait_mgr = Arc::clone(self);
        let wait_id = id.clone();
        tokio::spawn(async move {
            let exit = tokio::task::spawn_blocking(move || child.wait()).await;
            let (status, code) = match exit {
                Ok(Ok(exit)) => {
                    let code = exit.exit_code() as i32;
                    if exit.success() {
                        (ProcessStatus::Completed, Some(code))
                    } else {
                        (ProcessStatus::Failed, Some(code))
                    }
                }
                _ => (ProcessStatus::Failed, None),
            };
            wait_mgr.table.finish(&wait_id, status, code).await;
            wait_mgr.handles.lock().await.remove(&wait_id);
            wait_mgr.recovery.mark_dirty();
            tracing::info!(session_id = %wait_id, status = ?status, "terminal session ended");
        });

        // Runtime watchdog; the sweeper is a backstop for sessions that
        // outlive a missed timer.
        let timer_mgr = Arc::clone(self);
        let timer_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(max_runtime_ms)).await;
            if timer_mgr.table.is_running(&timer_id).await {
                tracing::warn!(session_id = %timer_id, "session exceeded max runtime, closing");
                let _ = timer_mgr.close(&timer_id).await;
            }
        });

        self.handles.lock().await.insert(
            id,
            SessionHandle {
                input: input_tx,
                killer: std::sync::Mutex::new(killer),
                pid,
            },
        );
        self.recovery.mark_dirty();
        Ok(record)
    }

    async fn sweep(&self) {
        for id in self.table.overdue_ids().await {
            tracing::warn!(session_id = %id, "sweeper closing overdue session");
            let _ = self.close(&id).await;
        }
    }

    /// Send raw bytes to the session's stdin. Control sequences pass through
    /// untouched.
    pub async fn write(&self, id: &str, data: &str) -> Result<(), ProcessError> {
        if !self.table.contains(id).await {
            return Err(ProcessError::NotFound(id.to_string()));
        }
        let handles = self.handles.lock().await;
        if let Some(handle) = handles.get(id) {
            let _ = handle.input.send(PtyInput::Data(data.to_string()));
        }
        Ok(())
    }

    /// Send a line of input followed by a newline, as if typed and entered.
    pub async fn submit_line(&self, id: &str, line: &str) -> Result<(), ProcessError> {
        self.write(id, &format!("{}\n", line)).await
    }

    pub async fn resize(&self, id: &str, rows: u16, cols: u16) -> Result<(), ProcessError> {
        if !self.table.contains(id).await {
            return Err(ProcessError::NotFound(id.to_string()));
        }
        let handles = self.handles.lock().await;
        if let Some(handle) = handles.get(id) {
            let _ = handle.input.send(PtyInput::Resize { rows, cols });
        }
        Ok(())
    }

    /// Output produced since the previous read of this session.
    pub async fn read_incremental(&self, id: &str) -> Result<String, ProcessError> {
        self.table.read_incremental(id).await
    }

    /// Full status snapshot with the complete captured transcript.
    pub async fn poll(&self, id: &str) -> Result<PollResult, ProcessError> {
        self.table.poll_result(id).await
    }

    /// Terminate the session: SIGTERM to the shell, a grace window, then the
    /// PTY-level hard kill. No-op when the session already ended.
    pub async fn close(&self, id: &str) -> Result<(), ProcessError> {
        if !self.table.contains(id).await {
            return Err(ProcessError::NotFound(id.to_string()));
        }
        if !self.table.is_running(id).await {
            return Ok(());
        }

        let pid = {
            let handles = self.handles.lock().await;
            handles.get(id).and_then(|h| h.pid)
        };
        if let Some(pid) = pid {
            send_signal(pid, libc::SIGTERM);
            self.table.wait_done(id, KILL_GRACE).await;
        }
        if self.table.is_running(id).await {
            let handles = self.handles.lock().await;
            if let Some(handle) = handles.get(id) {
                tracing::warn!(session_id = %id, "session ignored SIGTERM, hard-killing");
                let _ = handle.killer.lock().unwrap().kill();
            }
            drop(handles);
            self.table
                .wait_done(id, Duration::from_millis(2_000))
                .await;
        }
        Ok(())
    }

    pub async fn list(&self) -> Vec<ProcessRecord> {
        self.table.list().await
    }

    /// Stop the sweeper, close everything still running, and flush the
    /// recovery index.
    pub async fn shutdown(&self) {
        let handle = self.sweeper.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        let ids: Vec<String> = self
            .list()
            .await
            .into_iter()
            .filter(|r| r.status == ProcessStatus::Running)
            .map(|r| r.id)
            .collect();
        for id in ids {
            let _ = self.close(&id).await;
        }
        self.recovery.shutdown().await;
    }
}
