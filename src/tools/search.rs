//! Code search tools: grep/regex search over file contents.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{resolve_path_simple, ExecutionContext, Tool};

/// Search file contents with regex/grep.
pub struct GrepSearch;

#[async_trait]
impl Tool for GrepSearch {
    fn name(&self) -> &str {
        "grep_search"
    }

    fn description(&self) -> &str {
        "Search for a regex pattern in file contents. Searches the working directory by default. Good for finding definitions, usages, or log lines."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regex pattern to search for"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search. Defaults to '.'"
                },
                "file_pattern": {
                    "type": "string",
                    "description": "Optional: only search files matching this glob (e.g., '*.rs')"
                },
                "case_sensitive": {
                    "type": "boolean",
                    "description": "Whether the search is case-sensitive (default: false)"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<String> {
        let pattern = args["pattern"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'pattern' argument"))?;
        let path = args["path"].as_str().unwrap_or(".");
        let file_pattern = args["file_pattern"].as_str();
        let case_sensitive = args["case_sensitive"].as_bool().unwrap_or(false);

        let search_path = resolve_path_simple(path, &ctx.cwd().await);

        // Prefer ripgrep when installed, fall back to grep
        let mut cmd = if which_exists("rg") {
            let mut c = Command::new("rg");
            c.arg("--line-number");
            c.arg("--no-heading");
            c.arg("--color=never");
            if !case_sensitive {
                c.arg("-i");
            }
            if let Some(fp) = file_pattern {
                c.arg("-g").arg(fp);
            }
            c.arg("--").arg(pattern).arg(&search_path);
            c
        } else {
            let mut c = Command::new("grep");
            c.arg("-rn");
            if !case_sensitive {
                c.arg("-i");
            }
            if let Some(fp) = file_pattern {
                c.arg("--include").arg(fp);
            }
            c.arg(pattern).arg(&search_path);
            c
        };

        let output = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to execute search: {}", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        // grep exits 1 for "no matches", which is not an error here
        if !output.status.success() && output.status.code() != Some(1) && !stderr.is_empty() {
            return Err(anyhow::anyhow!("Search error: {}", stderr));
        }

        if stdout.is_empty() {
            return Ok(format!("No matches found for pattern: {}", pattern));
        }

        let result: String = stdout.lines().take(100).collect::<Vec<_>>().join("\n");
        if result.lines().count() >= 100 {
            Ok(format!("{}\n\n... (showing first 100 matches)", result))
        } else {
            Ok(result)
        }
    }
}

/// Check if a command exists in PATH.
fn which_exists(cmd: &str) -> bool {
    std::process::Command::new("which")
        .arg(cmd)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
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

    #[tokio::test]
    async fn finds_a_pattern_with_line_numbers() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("code.rs"), "fn alpha() {}\nfn beta() {}\n").unwrap();

        let out = GrepSearch
            .execute(serde_json::json!({"pattern": "fn beta"}), &ctx(&dir))
            .await
            .unwrap();
        assert!(out.contains("beta"));
        assert!(out.contains(":2"));
    }

    #[tokio::test]
    async fn no_match_is_a_friendly_message() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("code.rs"), "nothing here\n").unwrap();

        let out = GrepSearch
            .execute(
                serde_json::json!({"pattern": "totally_absent_symbol"}),
                &ctx(&dir),
            )
            .await
            .unwrap();
        assert!(out.contains("No matches found"));
    }
}
