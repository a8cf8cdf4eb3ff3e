//! File operation tools: read, write, delete files.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{resolve_path, ExecutionContext, PermissionLevel, Tool};

/// Read the contents of a file.
pub struct ReadFile;

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file's contents. Use relative paths like 'src/main.rs' (recommended) or absolute paths like '/etc/hosts' for system files."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path. Relative paths resolve from the working directory."
                },
                "start_line": {
                    "type": "integer",
                    "description": "Optional: start reading from this line number (1-indexed)"
                },
                "end_line": {
                    "type": "integer",
                    "description": "Optional: stop reading at this line number (inclusive)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<String> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'path' argument"))?;

        let resolution = resolve_path(path, &ctx.cwd().await);

        if !resolution.resolved.exists() {
            return Err(anyhow::anyhow!(
                "File not found: {} (resolved to: {})",
                path,
                resolution.resolved.display()
            ));
        }

        // Try to read as UTF-8 text, detect binary files
        let bytes = tokio::fs::read(&resolution.resolved).await?;
        let content = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                return Ok(format!(
                    "Binary file detected: {} ({} bytes). Cannot display binary content; use `run_command` with tools like `file`, `strings`, or `unzip -l` to inspect it.",
                    resolution.resolved.display(),
                    resolution.resolved.metadata().map(|m| m.len()).unwrap_or(0)
                ));
            }
        };

        // Handle optional line range
        let start_line = args["start_line"].as_u64().map(|n| n as usize);
        let end_line = args["end_line"].as_u64().map(|n| n as usize);

        if start_line.is_some() || end_line.is_some() {
            let lines: Vec<&str> = content.lines().collect();
            let total_lines = lines.len();
            let start = start_line.unwrap_or(1).saturating_sub(1).min(total_lines);
            let end = end_line.unwrap_or(total_lines).min(total_lines);
            let (start, end) = if start > end { (end, start) } else { (start, end) };

            if start >= total_lines {
                return Ok(format!(
                    "File has {} lines, requested start line {} is beyond end of file",
                    total_lines,
                    start + 1
                ));
            }

            let selected: Vec<String> = lines[start..end]
                .iter()
                .enumerate()
                .map(|(i, line)| format!("{:4}| {}", start + i + 1, line))
                .collect();
            return Ok(selected.join("\n"));
        }

        let numbered: Vec<String> = content
            .lines()
            .enumerate()
            .map(|(i, line)| format!("{:4}| {}", i + 1, line))
            .collect();
        Ok(numbered.join("\n"))
    }
}

/// Write content to a file (create or overwrite).
pub struct WriteFile;

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating it (and parent directories) if needed or overwriting if it exists."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path. Relative paths resolve from the working directory."
                },
                "content": {
                    "type": "string",
                    "description": "The full content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn requires_permission(&self) -> bool {
        true
    }

    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::Write
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<String> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'path' argument"))?;
        let content = args["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'content' argument"))?;

        let resolution = resolve_path(path, &ctx.cwd().await);

        if let Some(parent) = resolution.resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&resolution.resolved, content).await?;

        let note = resolution.note();
        let suffix = if note.is_empty() {
            String::new()
        } else {
            format!(" {}", note)
        };
        Ok(format!(
            "Wrote {} bytes to {}{}",
            content.len(),
            path,
            suffix
        ))
    }
}

/// Delete a file or an empty directory.
pub struct DeleteFile;

#[async_trait]
impl Tool for DeleteFile {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a file or an empty directory."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file or empty directory to delete"
                }
            },
            "required": ["path"]
        })
    }

    fn requires_permission(&self) -> bool {
        true
    }

    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::Write
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<String> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'path' argument"))?;

        let resolution = resolve_path(path, &ctx.cwd().await);

        if !resolution.resolved.exists() {
            return Err(anyhow::anyhow!("Path not found: {}", path));
        }

        let metadata = tokio::fs::metadata(&resolution.resolved).await?;
        if metadata.is_dir() {
            tokio::fs::remove_dir(&resolution.resolved).await.map_err(|e| {
                anyhow::anyhow!("Failed to delete directory {} (must be empty): {}", path, e)
            })?;
            Ok(format!("Deleted directory: {}", path))
        } else {
            tokio::fs::remove_file(&resolution.resolved).await?;
            Ok(format!("Deleted file: {}", path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::AllowAll;
    use std::path::PathBuf;
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

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);

        let out = WriteFile
            .execute(
                serde_json::json!({"path": "notes/hello.txt", "content": "line one\nline two"}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(out.contains("notes/hello.txt"));

        let read = ReadFile
            .execute(serde_json::json!({"path": "notes/hello.txt"}), &ctx)
            .await
            .unwrap();
        assert!(read.contains("1| line one"));
        assert!(read.contains("2| line two"));
    }

    #[tokio::test]
    async fn read_line_range() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let content = (1..=10).map(|i| format!("l{}", i)).collect::<Vec<_>>().join("\n");
        std::fs::write(dir.path().join("big.txt"), content).unwrap();

        let out = ReadFile
            .execute(
                serde_json::json!({"path": "big.txt", "start_line": 3, "end_line": 4}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(out.contains("3| l3"));
        assert!(out.contains("4| l4"));
        assert!(!out.contains("l5"));
    }

    #[tokio::test]
    async fn read_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = ReadFile
            .execute(serde_json::json!({"path": "absent.txt"}), &ctx(&dir))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }

    #[tokio::test]
    async fn delete_file_and_refuse_missing() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        std::fs::write(dir.path().join("gone.txt"), "x").unwrap();

        DeleteFile
            .execute(serde_json::json!({"path": "gone.txt"}), &ctx)
            .await
            .unwrap();
        assert!(!PathBuf::from(dir.path().join("gone.txt")).exists());

        assert!(DeleteFile
            .execute(serde_json::json!({"path": "gone.txt"}), &ctx)
            .await
            .is_err());
    }

    #[test]
    fn write_and_delete_are_permission_gated() {
        assert!(WriteFile.requires_permission());
        assert_eq!(WriteFile.permission_level(), PermissionLevel::Write);
        assert!(DeleteFile.requires_permission());
        assert!(!ReadFile.requires_permission());
    }
}
