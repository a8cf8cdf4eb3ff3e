//! Shell tools: foreground command execution plus background task control.
//!
//! `run_command` blocks until the command exits (bounded by a timeout). The
//! `start_task` family hands long-running work to the
//! [`BackgroundProcessManager`] and polls it by id, so a build or a dev
//! server does not stall the agent loop.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::process::{BackgroundProcessManager, ProcessRecord};

use super::{resolve_path_simple, ExecutionContext, PermissionLevel, Tool};

/// Sanitize command output to be safe for LLM consumption.
fn sanitize_output(bytes: &[u8]) -> String {
    let non_printable_count = bytes
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();

    // More than 10% non-printable (excluding newlines/tabs) reads as binary
    if bytes.len() > 100 && non_printable_count > bytes.len() / 10 {
        return format!(
            "[Binary output detected - {} bytes, {}% non-printable. \
            Use appropriate tools to process binary data.]",
            bytes.len(),
            non_printable_count * 100 / bytes.len()
        );
    }

    let text = String::from_utf8_lossy(bytes);
    text.chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || (c >= ' ' && c != '\u{FFFD}'))
        .collect()
}

/// Command patterns that cause runaway scans or damage the system.
const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    ("find /", "Use a specific directory path instead of root"),
    ("grep -r /", "Use a specific directory path instead of root"),
    ("grep -rn /", "Use a specific directory path instead of root"),
    ("grep -R /", "Use a specific directory path instead of root"),
    ("ls -laR /", "Use a specific directory path instead of root"),
    ("du -sh /", "Use a specific directory path instead of root"),
    ("du -a /", "Use a specific directory path instead of root"),
    ("rm -rf /", "This would destroy the entire system"),
    ("rm -rf /*", "This would destroy the entire system"),
    ("> /dev/", "Writing to device files is blocked"),
    ("dd if=/dev/", "Direct disk operations are blocked"),
];

/// Validate a command against dangerous patterns.
fn validate_command(cmd: &str) -> Result<(), String> {
    let cmd_trimmed = cmd.trim();

    for (pattern, suggestion) in DANGEROUS_PATTERNS {
        if cmd_trimmed.starts_with(pattern) {
            return Err(format!(
                "Blocked dangerous command pattern '{}'. {}",
                pattern, suggestion
            ));
        }
        // Also catch the pattern behind common wrappers.
        for prefix in ["sudo ", "time ", "nice ", "nohup "] {
            if let Some(rest) = cmd_trimmed.strip_prefix(prefix) {
                if rest.starts_with(pattern) {
                    return Err(format!(
                        "Blocked dangerous command pattern '{}'. {}",
                        pattern, suggestion
                    ));
                }
            }
        }
    }
    Ok(())
}

fn render_record(record: &ProcessRecord) -> String {
    format!(
        "{}  {:?}  started {}  cmd: {}",
        record.id,
        record.status,
        record.started_at.format("%H:%M:%S"),
        record.command
    )
}

/// Run a shell command in the foreground.
pub struct RunCommand;

#[async_trait]
impl Tool for RunCommand {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command and wait for it to finish. Runs in the working directory by default. Use for tests, builds, package installs, etc."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "cwd": {
                    "type": "string",
                    "description": "Optional: working directory for the command"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Timeout in seconds (default: 60)"
                }
            },
            "required": ["command"]
        })
    }

    fn min_generation(&self) -> u8 {
        2
    }

    fn requires_permission(&self) -> bool {
        true
    }

    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::Execute
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<String> {
        let command = args["command"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'command' argument"))?;

        if let Err(msg) = validate_command(command) {
            tracing::warn!(command = %command, "blocked dangerous command");
            return Err(anyhow::anyhow!("{}", msg));
        }

        let working_dir = ctx.cwd().await;
        let cwd = args["cwd"]
            .as_str()
            .map(|p| resolve_path_simple(p, &working_dir))
            .unwrap_or(working_dir);
        let timeout_secs = args["timeout_secs"].as_u64().unwrap_or(60);

        tracing::info!(cwd = %cwd.display(), command = %command, "executing command");
        ctx.emit(self.name(), format!("$ {command}"));

        let output = match tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            Command::new("/bin/sh")
                .arg("-c")
                .arg(command)
                .current_dir(&cwd)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(anyhow::anyhow!("Failed to execute command: {}", e));
            }
            Err(_) => {
                return Err(anyhow::anyhow!(
                    "Command timed out after {} seconds",
                    timeout_secs
                ));
            }
        };

        let stdout = sanitize_output(&output.stdout);
        let stderr = sanitize_output(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        let mut result = format!("Exit code: {}\n", exit_code);
        if !stdout.is_empty() {
            result.push_str("\n--- stdout ---\n");
            result.push_str(&stdout);
        }
        if !stderr.is_empty() {
            result.push_str("\n--- stderr ---\n");
            result.push_str(&stderr);
        }

        if result.len() > 10000 {
            result.truncate(10000);
            result.push_str("\n... [output truncated]");
        }
        Ok(result)
    }
}

/// Start a background task.
pub struct StartTask {
    manager: Arc<BackgroundProcessManager>,
}

impl StartTask {
    pub fn new(manager: Arc<BackgroundProcessManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for StartTask {
    fn name(&self) -> &str {
        "start_task"
    }

    fn description(&self) -> &str {
        "Start a long-running shell command in the background and return its task id immediately. Use poll_task to check on it."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to run in the background"
                },
                "max_runtime_ms": {
                    "type": "integer",
                    "description": "Optional: kill the task after this many milliseconds"
                }
            },
            "required": ["command"]
        })
    }

    fn min_generation(&self) -> u8 {
        3
    }

    fn requires_permission(&self) -> bool {
        true
    }

    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::Execute
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<String> {
        let command = args["command"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'command' argument"))?;
        if let Err(msg) = validate_command(command) {
            return Err(anyhow::anyhow!("{}", msg));
        }
        let max_runtime_ms = args["max_runtime_ms"].as_u64();

        let record = self
            .manager
            .start(command, &ctx.cwd().await, max_runtime_ms)
            .await?;
        ctx.emit(self.name(), format!("task {} running", record.id));
        Ok(format!("Started background task {}", record.id))
    }
}

/// Poll a background task for status and output.
pub struct PollTask {
    manager: Arc<BackgroundProcessManager>,
}

impl PollTask {
    pub fn new(manager: Arc<BackgroundProcessManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for PollTask {
    fn name(&self) -> &str {
        "poll_task"
    }

    fn description(&self) -> &str {
        "Check a background task's status and captured output. Set blocking=true to wait for completion up to timeout_ms."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": {
                    "type": "string",
                    "description": "The id returned by start_task"
                },
                "blocking": {
                    "type": "boolean",
                    "description": "Wait for the task to finish (default: false)"
                },
                "timeout_ms": {
                    "type": "integer",
                    "description": "Max wait when blocking (default: 30000)"
                }
            },
            "required": ["task_id"]
        })
    }

    fn min_generation(&self) -> u8 {
        3
    }

    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> anyhow::Result<String> {
        let task_id = args["task_id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'task_id' argument"))?;
        let blocking = args["blocking"].as_bool().unwrap_or(false);
        let timeout_ms = args["timeout_ms"].as_u64().unwrap_or(30_000);

        let result = self.manager.poll(task_id, blocking, timeout_ms).await?;
        let mut text = format!(
            "Task {}: {:?} ({} ms)",
            result.id, result.status, result.duration_ms
        );
        if let Some(code) = result.exit_code {
            text.push_str(&format!(", exit code {}", code));
        }
        if result.output.is_empty() {
            text.push_str("\n(no output yet)");
        } else {
            text.push_str("\n--- output ---\n");
            text.push_str(&result.output);
        }
        Ok(text)
    }
}

/// Kill a background task.
pub struct KillTask {
    manager: Arc<BackgroundProcessManager>,
}

impl KillTask {
    pub fn new(manager: Arc<BackgroundProcessManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for KillTask {
    fn name(&self) -> &str {
        "kill_task"
    }

    fn description(&self) -> &str {
        "Terminate a background task. The task gets a chance to exit cleanly before being force-killed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": {
                    "type": "string",
                    "description": "The id of the task to kill"
                }
            },
            "required": ["task_id"]
        })
    }

    fn min_generation(&self) -> u8 {
        3
    }

    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> anyhow::Result<String> {
        let task_id = args["task_id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'task_id' argument"))?;
        self.manager.kill(task_id).await?;
        Ok(format!("Task {} terminated", task_id))
    }
}

/// List background tasks.
pub struct ListTasks {
    manager: Arc<BackgroundProcessManager>,
}

impl ListTasks {
    pub fn new(manager: Arc<BackgroundProcessManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for ListTasks {
    fn name(&self) -> &str {
        "list_tasks"
    }

    fn description(&self) -> &str {
        "List background tasks with their status."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    fn min_generation(&self) -> u8 {
        3
    }

    async fn execute(&self, _args: Value, _ctx: &ExecutionContext) -> anyhow::Result<String> {
        let records = self.manager.list().await;
        if records.is_empty() {
            return Ok("No background tasks".to_string());
        }
        Ok(records
            .iter()
            .map(render_record)
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::AllowAll;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::RwLock;

    fn ctx(dir: &TempDir) -> ExecutionContext {
        ExecutionContext {
            working_dir: Arc::new(RwLock::new(dir.path().to_path_buf())),
            session_id: "test-session".to_string(),
            generation: 8,
            permissions: Arc::new(AllowAll),
            events: None,
        }
    }

    async fn manager(dir: &TempDir) -> Arc<BackgroundProcessManager> {
        BackgroundProcessManager::new(
            dir.path().join("logs"),
            dir.path().join("tasks.json"),
            8,
            60_000,
        )
        .await
    }

    #[test]
    fn dangerous_patterns_are_blocked() {
        assert!(validate_command("rm -rf /").is_err());
        assert!(validate_command("sudo rm -rf /").is_err());
        assert!(validate_command("find / -name x").is_err());
        assert!(validate_command("ls -la").is_ok());
        assert!(validate_command("rm -rf ./build").is_ok());
    }

    #[test]
    fn binary_output_is_summarized() {
        let mut bytes = vec![0u8; 500];
        bytes.extend_from_slice(b"some text");
        let out = sanitize_output(&bytes);
        assert!(out.contains("Binary output detected"));

        assert_eq!(sanitize_output(b"plain\ttext\n"), "plain\ttext\n");
    }

    #[tokio::test]
    async fn run_command_reports_exit_code_and_streams() {
        let dir = TempDir::new().unwrap();
        let out = RunCommand
            .execute(
                serde_json::json!({"command": "echo out; echo err >&2; exit 2"}),
                &ctx(&dir),
            )
            .await
            .unwrap();
        assert!(out.contains("Exit code: 2"));
        assert!(out.contains("out"));
        assert!(out.contains("err"));
    }

    #[tokio::test]
    async fn run_command_emits_progress_event() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = ExecutionContext {
            events: Some(tx),
            ..ctx(&dir)
        };
        RunCommand
            .execute(serde_json::json!({"command": "true"}), &ctx)
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.tool, "run_command");
        assert_eq!(event.message, "$ true");
    }

    #[tokio::test]
    async fn run_command_times_out() {
        let dir = TempDir::new().unwrap();
        let err = RunCommand
            .execute(
                serde_json::json!({"command": "sleep 5", "timeout_secs": 1}),
                &ctx(&dir),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn task_tools_round_trip() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;
        let ctx = ctx(&dir);

        let started = StartTask::new(Arc::clone(&mgr))
            .execute(serde_json::json!({"command": "echo task-output"}), &ctx)
            .await
            .unwrap();
        let task_id = started.rsplit(' ').next().unwrap().to_string();

        let polled = PollTask::new(Arc::clone(&mgr))
            .execute(
                serde_json::json!({"task_id": task_id, "blocking": true, "timeout_ms": 5000}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(polled.contains("Completed"));
        assert!(polled.contains("task-output"));

        let listed = ListTasks::new(mgr)
            .execute(serde_json::json!({}), &ctx)
            .await
            .unwrap();
        assert!(listed.contains(&task_id));
    }

    #[tokio::test]
    async fn poll_unknown_task_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;
        assert!(PollTask::new(mgr)
            .execute(serde_json::json!({"task_id": "missing"}), &ctx(&dir))
            .await
            .is_err());
    }
}
