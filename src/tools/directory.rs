//! Directory operation tools: list directory, search files by name.

use async_trait::async_trait;
use serde_json::{json, Value};
use walkdir::WalkDir;

use super::{resolve_path, ExecutionContext, Tool};

/// List contents of a directory.
pub struct ListDirectory;

#[async_trait]
impl Tool for ListDirectory {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List files and directories. Use '.' for the current working directory, relative paths like 'src/', or absolute paths."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path. Use '.' for the working directory root."
                },
                "max_depth": {
                    "type": "integer",
                    "description": "Maximum depth to traverse (default: 3)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<String> {
        let path = args["path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'path' argument"))?;
        let max_depth = args["max_depth"].as_u64().unwrap_or(3) as usize;

        let resolution = resolve_path(path, &ctx.cwd().await);

        if !resolution.resolved.exists() {
            return Err(anyhow::anyhow!(
                "Directory not found: {} (resolved to: {})",
                path,
                resolution.resolved.display()
            ));
        }
        if !resolution.resolved.is_dir() {
            return Err(anyhow::anyhow!("Not a directory: {}", path));
        }

        let root = resolution.resolved;
        let mut entries = Vec::new();
        let walker = WalkDir::new(&root).max_depth(max_depth).sort_by_file_name();

        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            let depth = entry.depth();
            let path = entry.path();
            let relative = path.strip_prefix(&root).unwrap_or(path);
            if relative.as_os_str().is_empty() {
                continue;
            }

            let prefix = "  ".repeat(depth.saturating_sub(1));
            let name = relative
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let suffix = if path.is_dir() { "/" } else { "" };
            entries.push(format!("{}{}{}", prefix, name, suffix));
        }

        if entries.is_empty() {
            Ok("Directory is empty".to_string())
        } else {
            Ok(entries.join("\n"))
        }
    }
}

/// Search for files by name pattern.
pub struct SearchFiles;

#[async_trait]
impl Tool for SearchFiles {
    fn name(&self) -> &str {
        "search_files"
    }

    fn description(&self) -> &str {
        "Search for files by name pattern (glob-style, e.g. '*.rs') or substring. Searches the working directory by default."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "File name pattern (e.g., '*.rs', 'test_*.py') or a plain substring"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search in. Defaults to '.'"
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

        let resolution = resolve_path(path, &ctx.cwd().await);
        let root = resolution.resolved;
        if !root.exists() {
            return Err(anyhow::anyhow!(
                "Directory not found: {} (resolved to: {})",
                path,
                root.display()
            ));
        }

        let pattern_lower = pattern.to_lowercase();
        let is_glob = pattern.contains('*');

        let mut matches = Vec::new();
        for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_lowercase();
            let matched = if is_glob {
                glob_match(&pattern_lower, &file_name)
            } else {
                file_name.contains(&pattern_lower)
            };
            if matched {
                matches.push(entry.path().to_string_lossy().to_string());
            }
            if matches.len() >= 100 {
                matches.push("... (results truncated, showing first 100)".to_string());
                break;
            }
        }

        if matches.is_empty() {
            Ok(format!("No files matching '{}' found", pattern))
        } else {
            Ok(matches.join("\n"))
        }
    }
}

/// Minimal glob matching: literal segments separated by `*` wildcards.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut pos = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !text.starts_with(part) {
                return false;
            }
            pos = part.len();
        } else if i == parts.len() - 1 {
            return text[pos..].ends_with(part);
        } else {
            match text[pos..].find(part) {
                Some(found) => pos += found + part.len(),
                None => return false,
            }
        }
    }
    true
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

    #[test]
    fn glob_matching_covers_the_common_shapes() {
        assert!(glob_match("*.rs", "main.rs"));
        assert!(!glob_match("*.rs", "main.py"));
        assert!(glob_match("test_*", "test_parser.py"));
        assert!(glob_match("readme*", "readme.md"));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b*c", "axxbyy"));
        assert!(glob_match("exact", "exact"));
    }

    #[tokio::test]
    async fn list_shows_nested_entries_with_indent() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "").unwrap();
        std::fs::write(dir.path().join("README.md"), "").unwrap();

        let out = ListDirectory
            .execute(serde_json::json!({"path": "."}), &ctx(&dir))
            .await
            .unwrap();
        assert!(out.contains("src/"));
        assert!(out.contains("  lib.rs"));
        assert!(out.contains("README.md"));
    }

    #[tokio::test]
    async fn search_finds_by_glob() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("alpha.rs"), "").unwrap();
        std::fs::write(dir.path().join("beta.py"), "").unwrap();

        let out = SearchFiles
            .execute(serde_json::json!({"pattern": "*.rs"}), &ctx(&dir))
            .await
            .unwrap();
        assert!(out.contains("alpha.rs"));
        assert!(!out.contains("beta.py"));
    }

    #[tokio::test]
    async fn list_missing_directory_errors() {
        let dir = TempDir::new().unwrap();
        assert!(ListDirectory
            .execute(serde_json::json!({"path": "nope"}), &ctx(&dir))
            .await
            .is_err());
    }
}
