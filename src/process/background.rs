//! Background task manager: fire-and-forget shell commands with polling.
//!
//! Commands run under `/bin/sh -c` with piped output captured into the shared
//! [`ProcessTable`]. A periodic sweeper kills tasks that exceed their maximum
//! runtime and evicts finished entries, and every state change schedules a
//! write of the crash-recovery index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::lifecycle::{
    send_signal, PollResult, ProcessRecord, ProcessStatus, ProcessTable, GC_INTERVAL, KILL_GRACE,
};
use super::recovery::RecoveryStore;
use super::ProcessError;

pub struct BackgroundProcessManager {
    table: Arc<ProcessTable>,
    recovery: Arc<RecoveryStore>,
    pids: Mutex<HashMap<String, u32>>,
    log_dir: PathBuf,
    default_timeout_ms: u64,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundProcessManager {
    /// Restore orphans from the recovery index at `recovery_path`, then start
    /// the periodic sweeper.
    pub async fn new(
        log_dir: impl Into<PathBuf>,
        recovery_path: impl Into<PathBuf>,
        capacity: usize,
        default_timeout_ms: u64,
    ) -> Arc<Self> {
        let log_dir = log_dir.into();
        let recovery_path = recovery_path.into();
        let table = Arc::new(ProcessTable::new(capacity));

        for orphan in RecoveryStore::load_orphans(&recovery_path) {
            table.insert_recovered(orphan).await;
        }
        let recovery = RecoveryStore::new(recovery_path, Arc::clone(&table));

        let manager = Arc::new(Self {
            table,
            recovery,
            pids: Mutex::new(HashMap::new()),
            log_dir,
            default_timeout_ms,
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

    /// Spawn `command` under `/bin/sh -c` in `cwd` and start tracking it.
    /// The table slot is claimed before the OS spawn, so a capacity failure
    /// never leaves a stray child behind.
    pub async fn start(
        self: &Arc<Self>,
        command: &str,
        cwd: &Path,
        max_runtime_ms: Option<u64>,
    ) -> Result<ProcessRecord, ProcessError> {
        let max_runtime_ms = max_runtime_ms.unwrap_or(self.default_timeout_ms);
        let record = ProcessRecord::spawn(command, cwd, max_runtime_ms, &self.log_dir);
        let id = record.id.clone();
        self.table.insert(record.clone()).await?;

        let mut child = match tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.table
                    .finish(&id, ProcessStatus::Failed, None)
                    .await;
                return Err(ProcessError::Spawn(e.to_string()));
            }
        };

        if let Some(pid) = child.id() {
            self.pids.lock().await.insert(id.clone(), pid);
        }
        tracing::info!(task_id = %id, command = %command, pid = ?child.id(), "background task started");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(Self::pump(Arc::clone(&self.table), id.clone(), stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(Self::pump(Arc::clone(&self.table), id.clone(), stderr));
        }

        // Runtime watchdog; the sweeper is a backstop for tasks that outlive
        // a missed timer.
        let timer_mgr = Arc::clone(self);
        let timer_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(max_runtime_ms)).await;
            if timer_mgr.table.is_running(&timer_id).await {
                tracing::warn!(task_id = %timer_id, "task exceeded max runtime, killing");
                let _ = timer_mgr.kill(&timer_id).await;
            }
        });

        let wait_mgr = Arc::clone(self);
        let wait_id = id.clone();
        tokio::spawn(async move {
            let (status, code) = match child.wait().await {
                Ok(exit) => {
                    let code = exit.code();
                    if exit.success() {
                        (ProcessStatus::Completed, code)
                    } else {
                        (ProcessStatus::Failed, code)
                    }
                }
                Err(e) => {
                    tracing::error!(task_id = %wait_id, error = %e, "failed to reap task");
                    (ProcessStatus::Failed, None)
                }
            };
            wait_mgr.table.finish(&wait_id, status, code).await;
            wait_mgr.pids.lock().await.remove(&wait_id);
            wait_mgr.recovery.mark_dirty();
            tracing::info!(task_id = %wait_id, status = ?status, exit_code = ?code, "background task ended");
        });

        self.recovery.mark_dirty();
        Ok(record)
    }

    async fn pump(table: Arc<ProcessTable>, id: String, mut source: impl AsyncReadExt + Unpin) {
        let mut buf = [0u8; 8192];
        loop {
            match source.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => table.append_output(&id, &buf[..n]).await,
            }
        }
    }

    /// Current status and full captured output. With `blocking` set, waits up
    /// to `timeout_ms` for the task to finish first; on timeout the result
    /// simply still says `running`.
    pub async fn poll(
        &self,
        id: &str,
        blocking: bool,
        timeout_ms: u64,
    ) -> Result<PollResult, ProcessError> {
        if blocking && self.table.is_running(id).await {
            self.table
                .wait_done(id, Duration::from_millis(timeout_ms))
                .await;
        }
        self.table.poll_result(id).await
    }

    /// Terminate a task: SIGTERM, a grace window, then SIGKILL. Killing a
    /// task that already finished is a no-op.
    pub async fn kill(&self, id: &str) -> Result<(), ProcessError> {
        if !self.table.contains(id).await {
            return Err(ProcessError::NotFound(id.to_string()));
        }
        if !self.table.is_running(id).await {
            return Ok(());
        }
        let pid = self.pids.lock().await.get(id).copied();
        let Some(pid) = pid else {
            // Running entry without a live pid cannot happen for tasks we
            // spawned; mark it failed so it stops occupying a slot.
            self.table.finish(id, ProcessStatus::Failed, None).await;
            return Ok(());
        };

        tracing::info!(task_id = %id, pid, "terminating background task");
        send_signal(pid, libc::SIGTERM);
        self.table.wait_done(id, KILL_GRACE).await;
        if self.table.is_running(id).await {
            tracing::warn!(task_id = %id, pid, "task ignored SIGTERM, sending SIGKILL");
            send_signal(pid, libc::SIGKILL);
            self.table.wait_done(id, KILL_GRACE).await;
        }
        self.recovery.mark_dirty();
        Ok(())
    }

    pub async fn list(&self) -> Vec<ProcessRecord> {
        self.table.list().await
    }

    async fn sweep(&self) {
        for id in self.table.overdue_ids().await {
            tracing::warn!(task_id = %id, "sweeper killing overdue task");
            let _ = self.kill(&id).await;
        }
        let evicted = self.table.evict_finished().await;
        if evicted > 0 {
            self.recovery.mark_dirty();
        }
    }

    /// Stop the sweeper, kill everything still running, and flush the
    /// recovery index. Safe to call more than once.
    pub async fn shutdown(&self) {
        let handle = self.sweeper.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        let running: Vec<String> = self
            .list()
            .await
            .into_iter()
            .filter(|r| r.status == ProcessStatus::Running)
            .map(|r| r.id)
            .collect();
        for id in running {
            let _ = self.kill(&id).await;
        }
        self.recovery.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn manager(dir: &TempDir) -> Arc<BackgroundProcessManager> {
        BackgroundProcessManager::new(
            dir.path().join("logs"),
            dir.path().join("tasks.json"),
            8,
            60_000,
        )
        .await
    }

    #[tokio::test]
    async fn short_command_completes_with_output() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;
        let record = mgr
            .start("echo hello from the background", dir.path(), None)
            .await
            .unwrap();

        let result = mgr.poll(&record.id, true, 5_000).await.unwrap();
        assert_eq!(result.status, ProcessStatus::Completed);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.output.contains("hello from the background"));
    }

    #[tokio::test]
    async fn failing_command_reports_failed_with_exit_code() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;
        let record = mgr.start("exit 3", dir.path(), None).await.unwrap();

        let result = mgr.poll(&record.id, true, 5_000).await.unwrap();
        assert_eq!(result.status, ProcessStatus::Failed);
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn stderr_is_captured_too() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;
        let record = mgr
            .start("echo oops >&2", dir.path(), None)
            .await
            .unwrap();

        let result = mgr.poll(&record.id, true, 5_000).await.unwrap();
        assert!(result.output.contains("oops"));
    }

    #[tokio::test]
    async fn kill_stops_a_long_runner() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;
        let record = mgr.start("sleep 30", dir.path(), None).await.unwrap();

        mgr.kill(&record.id).await.unwrap();
        let result = mgr.poll(&record.id, false, 0).await.unwrap();
        assert_eq!(result.status, ProcessStatus::Failed);

        // Killing again is a no-op.
        mgr.kill(&record.id).await.unwrap();
    }

    #[tokio::test]
    async fn kill_unknown_id_is_not_found() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;
        assert!(matches!(
            mgr.kill("no-such-task").await,
            Err(ProcessError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn max_runtime_kills_the_task() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;
        let record = mgr
            .start("sleep 30", dir.path(), Some(200))
            .await
            .unwrap();

        mgr.table
            .wait_done(&record.id, Duration::from_secs(10))
            .await;
        let result = mgr.poll(&record.id, false, 0).await.unwrap();
        assert_eq!(result.status, ProcessStatus::Failed);
    }

    #[tokio::test]
    async fn nonblocking_poll_sees_running() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;
        let record = mgr.start("sleep 5", dir.path(), None).await.unwrap();

        let result = mgr.poll(&record.id, false, 0).await.unwrap();
        assert_eq!(result.status, ProcessStatus::Running);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_kills_running_and_flushes_index() {
        let dir = TempDir::new().unwrap();
        let index = dir.path().join("tasks.json");
        let mgr = BackgroundProcessManager::new(dir.path().join("logs"), &index, 8, 60_000).await;
        mgr.start("sleep 30", dir.path(), None).await.unwrap();

        mgr.shutdown().await;
        assert!(index.exists());
        let orphans = RecoveryStore::load_orphans(&index);
        // Everything was killed before the flush, so nothing is orphaned.
        assert!(orphans.is_empty());
    }
}
