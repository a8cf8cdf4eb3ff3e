//! Interactive terminal tools over the PTY session manager.
//!
//! These give the agent a persistent shell it can type into, useful for
//! REPLs, TUIs, and programs that ask questions. Output reads are
//! incremental, so repeated `read_terminal` calls only return what appeared
//! since the previous read.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::process::PtySessionManager;

use super::{ExecutionContext, PermissionLevel, Tool};

/// Open a new PTY-backed terminal session.
pub struct OpenTerminal {
    manager: Arc<PtySessionManager>,
}

impl OpenTerminal {
    pub fn new(manager: Arc<PtySessionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for OpenTerminal {
    fn name(&self) -> &str {
        "open_terminal"
    }

    fn description(&self) -> &str {
        "Open an interactive terminal session. Leave 'command' empty for a plain shell, or provide one to run it in the terminal. Returns a session id."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Optional command to run; empty means an interactive shell"
                },
                "rows": {
                    "type": "integer",
                    "description": "Terminal height in rows (default: 24)"
                },
                "cols": {
                    "type": "integer",
                    "description": "Terminal width in columns (default: 80)"
                },
                "max_runtime_ms": {
                    "type": "integer",
                    "description": "Optional max session lifetime in milliseconds (default: 24h)"
                }
            }
        })
    }

    fn min_generation(&self) -> u8 {
        4
    }

    fn requires_permission(&self) -> bool {
        true
    }

    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::Execute
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<String> {
        let command = args["command"].as_str().unwrap_or("");
        let rows = args["rows"].as_u64().unwrap_or(24) as u16;
        let cols = args["cols"].as_u64().unwrap_or(80) as u16;
        let max_runtime_ms = args["max_runtime_ms"].as_u64();

        let record = self
            .manager
            .open(command, &ctx.cwd().await, rows, cols, max_runtime_ms)
            .await?;
        Ok(format!("Opened terminal session {}", record.id))
    }
}

/// Send input to a terminal session.
pub struct SendTerminalInput {
    manager: Arc<PtySessionManager>,
}

impl SendTerminalInput {
    pub fn new(manager: Arc<PtySessionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SendTerminalInput {
    fn name(&self) -> &str {
        "send_terminal_input"
    }

    fn description(&self) -> &str {
        "Type into a terminal session. By default the input is submitted as a line (newline appended); set raw=true to send bytes exactly as given, e.g. control sequences."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": {
                    "type": "string",
                    "description": "The id returned by open_terminal"
                },
                "input": {
                    "type": "string",
                    "description": "Text to send"
                },
                "raw": {
                    "type": "boolean",
                    "description": "Send exactly as given without a trailing newline (default: false)"
                }
            },
            "required": ["session_id", "input"]
        })
    }

    fn min_generation(&self) -> u8 {
        4
    }

    fn requires_permission(&self) -> bool {
        true
    }

    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::Execute
    }

    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> anyhow::Result<String> {
        let session_id = args["session_id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'session_id' argument"))?;
        let input = args["input"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'input' argument"))?;
        let raw = args["raw"].as_bool().unwrap_or(false);

        if raw {
            self.manager.write(session_id, input).await?;
        } else {
            self.manager.submit_line(session_id, input).await?;
        }
        Ok(format!("Sent {} bytes to session {}", input.len(), session_id))
    }
}

/// Read new output from a terminal session.
pub struct ReadTerminal {
    manager: Arc<PtySessionManager>,
}

impl ReadTerminal {
    pub fn new(manager: Arc<PtySessionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for ReadTerminal {
    fn name(&self) -> &str {
        "read_terminal"
    }

    fn description(&self) -> &str {
        "Read output from a terminal session that appeared since the last read."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": {
                    "type": "string",
                    "description": "The id returned by open_terminal"
                }
            },
            "required": ["session_id"]
        })
    }

    fn min_generation(&self) -> u8 {
        4
    }

    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> anyhow::Result<String> {
        let session_id = args["session_id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'session_id' argument"))?;

        let delta = self.manager.read_incremental(session_id).await?;
        if delta.is_empty() {
            let status = self.manager.poll(session_id).await?;
            Ok(format!("(no new output; session is {:?})", status.status))
        } else {
            Ok(delta)
        }
    }
}

/// Resize a terminal session.
pub struct ResizeTerminal {
    manager: Arc<PtySessionManager>,
}

impl ResizeTerminal {
    pub fn new(manager: Arc<PtySessionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for ResizeTerminal {
    fn name(&self) -> &str {
        "resize_terminal"
    }

    fn description(&self) -> &str {
        "Resize a terminal session's rows and columns."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": {
                    "type": "string",
                    "description": "The id returned by open_terminal"
                },
                "rows": {
                    "type": "integer",
                    "description": "New height in rows"
                },
                "cols": {
                    "type": "integer",
                    "description": "New width in columns"
                }
            },
            "required": ["session_id", "rows", "cols"]
        })
    }

    fn min_generation(&self) -> u8 {
        4
    }

    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> anyhow::Result<String> {
        let session_id = args["session_id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'session_id' argument"))?;
        let rows = args["rows"]
            .as_u64()
            .ok_or_else(|| anyhow::anyhow!("Missing 'rows' argument"))? as u16;
        let cols = args["cols"]
            .as_u64()
            .ok_or_else(|| anyhow::anyhow!("Missing 'cols' argument"))? as u16;

        self.manager.resize(session_id, rows, cols).await?;
        Ok(format!("Resized session {} to {}x{}", session_id, cols, rows))
    }
}

/// Close a terminal session.
pub struct CloseTerminal {
    manager: Arc<PtySessionManager>,
}

impl CloseTerminal {
    pub fn new(manager: Arc<PtySessionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for CloseTerminal {
    fn name(&self) -> &str {
        "close_terminal"
    }

    fn description(&self) -> &str {
        "Terminate a terminal session. Closing an already-ended session is harmless."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": {
                    "type": "string",
                    "description": "The id of the session to close"
                }
            },
            "required": ["session_id"]
        })
    }

    fn min_generation(&self) -> u8 {
        4
    }

    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> anyhow::Result<String> {
        let session_id = args["session_id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'session_id' argument"))?;

        self.manager.close(session_id).await?;
        Ok(format!("Closed terminal session {}", session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::AllowAll;
    use std::time::Duration;
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

    async fn mgr(dir: &TempDir) -> Arc<PtySessionManager> {
        PtySessionManager::new(dir.path().join("logs"), dir.path().join("pty.json"), 4).await
    }

    #[tokio::test]
    async fn open_type_read_close() {
        let dir = TempDir::new().unwrap();
        let mgr = mgr(&dir).await;
        let ctx = ctx(&dir);

        let opened = OpenTerminal::new(Arc::clone(&mgr))
            .execute(serde_json::json!({}), &ctx)
            .await
            .unwrap();
        let session_id = opened.rsplit(' ').next().unwrap().to_string();

        SendTerminalInput::new(Arc::clone(&mgr))
            .execute(
                serde_json::json!({"session_id": session_id, "input": "echo typed-here"}),
                &ctx,
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let read = ReadTerminal::new(Arc::clone(&mgr))
            .execute(serde_json::json!({"session_id": session_id}), &ctx)
            .await
            .unwrap();
        assert!(read.contains("typed-here"));

        CloseTerminal::new(mgr)
            .execute(serde_json::json!({"session_id": session_id}), &ctx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_session_errors() {
        let dir = TempDir::new().unwrap();
        let mgr = mgr(&dir).await;
        assert!(ReadTerminal::new(mgr)
            .execute(serde_json::json!({"session_id": "ghost"}), &ctx(&dir))
            .await
            .is_err());
    }
}
