//! Tool system for the agent.
//!
//! Tools are the hands and eyes of the agent: file access, shell commands,
//! background tasks, and interactive terminals. Each tool declares the
//! capability generation it first becomes available in and whether invoking
//! it needs an explicit permission grant; the executor in [`crate::exec`]
//! enforces both before a tool body ever runs.
//!
//! ## Workspace-First Design
//!
//! Tools work relative to the session's working directory by default:
//! - Relative paths (e.g. `output/report.md`) resolve from the workspace
//! - Absolute paths (e.g. `/etc/hosts`) work as an escape hatch

mod directory;
mod file_ops;
mod search;
mod shell;
mod terminal;

pub use directory::{ListDirectory, SearchFiles};
pub use file_ops::{DeleteFile, ReadFile, WriteFile};
pub use search::GrepSearch;
pub use shell::{KillTask, ListTasks, PollTask, RunCommand, StartTask};
pub use terminal::{
    CloseTerminal, OpenTerminal, ReadTerminal, ResizeTerminal, SendTerminalInput,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use crate::llm::{FunctionDefinition, ToolDefinition};
use crate::process::{BackgroundProcessManager, PtySessionManager};

// ============================================================================
// Path Resolution Utilities
// ============================================================================

/// Result of resolving a path relative to the workspace.
#[derive(Debug, Clone)]
pub struct PathResolution {
    /// The original path string provided by the agent.
    pub original: String,
    /// The fully resolved absolute path.
    pub resolved: PathBuf,
    /// Whether the resolved path is outside the workspace.
    pub is_outside_workspace: bool,
    /// Whether the original path was absolute.
    pub was_absolute: bool,
}

impl PathResolution {
    /// Format a note about path resolution for tool output.
    ///
    /// Empty for the normal case of a relative path inside the workspace.
    pub fn note(&self) -> String {
        if self.was_absolute {
            format!("[absolute path: {}]", self.resolved.display())
        } else if self.is_outside_workspace {
            format!("[resolved to: {}]", self.resolved.display())
        } else {
            String::new()
        }
    }
}

/// Resolve a path relative to the workspace.
///
/// - Relative paths are joined with `workspace`
/// - Absolute paths are used as-is (escape hatch)
pub fn resolve_path(path_str: &str, workspace: &Path) -> PathResolution {
    let path = Path::new(path_str);
    let was_absolute = path.is_absolute();

    let resolved = if was_absolute {
        path.to_path_buf()
    } else {
        workspace.join(path)
    };

    // Canonicalize for accurate comparison (handles .., symlinks, etc.)
    let canonical_resolved = resolved.canonicalize().unwrap_or_else(|_| resolved.clone());
    let canonical_workspace = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());

    let is_outside_workspace = !canonical_resolved.starts_with(&canonical_workspace);

    PathResolution {
        original: path_str.to_string(),
        resolved,
        is_outside_workspace,
        was_absolute,
    }
}

/// Simple path resolution that just returns the resolved path.
pub fn resolve_path_simple(path_str: &str, workspace: &Path) -> PathBuf {
    let path = Path::new(path_str);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

// ============================================================================
// Permissions and Execution Context
// ============================================================================

/// Coarse classification of a tool's effect, used to decide whether a
/// human-in-the-loop confirmation is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionLevel {
    Read,
    Write,
    Execute,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::Read => "read",
            PermissionLevel::Write => "write",
            PermissionLevel::Execute => "execute",
        }
    }
}

/// Decides whether a gated tool invocation may proceed. Supplied by the
/// hosting CLI; the executor never assumes a default answer.
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn allow(&self, tool: &str, level: PermissionLevel, args: &Value) -> bool;
}

/// Grants everything. For tests and explicitly trusted sessions.
pub struct AllowAll;

#[async_trait]
impl PermissionHandler for AllowAll {
    async fn allow(&self, _tool: &str, _level: PermissionLevel, _args: &Value) -> bool {
        true
    }
}

/// A progress event emitted by a tool while it runs.
#[derive(Debug, Clone)]
pub struct ToolEvent {
    pub tool: String,
    pub message: String,
}

/// Per-invocation execution context. Owned by the caller for the duration of
/// one tool call; the working directory is read through a shared handle so a
/// directory change between calls is observed by the next one.
#[derive(Clone)]
pub struct ExecutionContext {
    pub working_dir: Arc<RwLock<PathBuf>>,
    pub session_id: String,
    pub generation: u8,
    pub permissions: Arc<dyn PermissionHandler>,
    /// Optional channel for mid-execution progress events.
    pub events: Option<mpsc::UnboundedSender<ToolEvent>>,
}

impl ExecutionContext {
    pub async fn cwd(&self) -> PathBuf {
        self.working_dir.read().await.clone()
    }

    /// Emit a progress event if a listener is attached. Send failures are
    /// ignored; a closed listener must not fail the tool.
    pub fn emit(&self, tool: &str, message: impl Into<String>) {
        if let Some(tx) = &self.events {
            let _ = tx.send(ToolEvent {
                tool: tool.to_string(),
                message: message.into(),
            });
        }
    }
}

// ============================================================================
// Tool Trait and Registry
// ============================================================================

/// Information about a tool for display purposes.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub min_generation: u8,
}

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// First capability generation this tool is enabled in. Generations form
    /// a ladder: every generation includes all tools of the ones below it.
    fn min_generation(&self) -> u8 {
        1
    }

    /// Whether invoking this tool requires an explicit permission grant.
    fn requires_permission(&self) -> bool {
        false
    }

    fn permission_level(&self) -> PermissionLevel {
        PermissionLevel::Read
    }

    /// Execute the tool with the given arguments.
    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> anyhow::Result<String>;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),
}

/// Registry of available tools. Built once at startup, never mutated after.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Create a registry with the full built-in tool set wired to the given
    /// process managers.
    pub fn builtin(
        background: Arc<BackgroundProcessManager>,
        terminals: Arc<PtySessionManager>,
    ) -> Self {
        let mut registry = Self::empty();
        let tools: Vec<Arc<dyn Tool>> = vec![
            // File operations
            Arc::new(ReadFile),
            Arc::new(WriteFile),
            Arc::new(DeleteFile),
            // Directory operations
            Arc::new(ListDirectory),
            Arc::new(SearchFiles),
            // Search
            Arc::new(GrepSearch),
            // Shell
            Arc::new(RunCommand),
            // Background tasks
            Arc::new(StartTask::new(Arc::clone(&background))),
            Arc::new(PollTask::new(Arc::clone(&background))),
            Arc::new(KillTask::new(Arc::clone(&background))),
            Arc::new(ListTasks::new(background)),
            // Interactive terminals
            Arc::new(OpenTerminal::new(Arc::clone(&terminals))),
            Arc::new(SendTerminalInput::new(Arc::clone(&terminals))),
            Arc::new(ReadTerminal::new(Arc::clone(&terminals))),
            Arc::new(ResizeTerminal::new(Arc::clone(&terminals))),
            Arc::new(CloseTerminal::new(terminals)),
        ];
        for tool in tools {
            // Built-in names are unique by construction.
            let _ = registry.register(tool);
        }
        tracing::info!(tool_count = registry.tools.len(), "tool registry ready");
        registry
    }

    /// Register a tool. Fails if the name is already taken.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateTool(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Whether `name` exists and is enabled in `generation`.
    pub fn available_in_generation(&self, name: &str, generation: u8) -> bool {
        self.tools
            .get(name)
            .map(|t| t.min_generation() <= generation)
            .unwrap_or(false)
    }

    /// Tool schemas in LLM-compatible format, limited to the tools enabled
    /// in `generation`.
    pub fn schemas_for_generation(&self, generation: u8) -> Vec<ToolDefinition> {
        let mut schemas: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| t.min_generation() <= generation)
            .map(|t| ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    parameters: t.parameters_schema(),
                },
            })
            .collect();
        schemas.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        schemas
    }

    /// List all registered tools.
    pub fn list(&self) -> Vec<ToolInfo> {
        let mut infos: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
                min_generation: t.min_generation(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Dummy(&'static str, u8);

    #[async_trait]
    impl Tool for Dummy {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "dummy"
        }
        fn parameters_schema(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        fn min_generation(&self) -> u8 {
            self.1
        }
        async fn execute(&self, _args: Value, _ctx: &ExecutionContext) -> anyhow::Result<String> {
            Ok("ok".to_string())
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ToolRegistry::empty();
        registry.register(Arc::new(Dummy("twice", 1))).unwrap();
        assert!(matches!(
            registry.register(Arc::new(Dummy("twice", 1))),
            Err(RegistryError::DuplicateTool(name)) if name == "twice"
        ));
    }

    #[test]
    fn generation_ladder_is_a_superset_chain() {
        let mut registry = ToolRegistry::empty();
        registry.register(Arc::new(Dummy("basic", 1))).unwrap();
        registry.register(Arc::new(Dummy("shelly", 2))).unwrap();
        registry.register(Arc::new(Dummy("fancy", 4))).unwrap();

        assert!(registry.available_in_generation("basic", 1));
        assert!(!registry.available_in_generation("shelly", 1));
        assert!(registry.available_in_generation("shelly", 2));
        assert!(registry.available_in_generation("fancy", 8));
        assert!(!registry.available_in_generation("missing", 8));

        // Everything visible at gen N is visible at gen N+1.
        let at_2: Vec<String> = registry
            .schemas_for_generation(2)
            .into_iter()
            .map(|s| s.function.name)
            .collect();
        let at_4: Vec<String> = registry
            .schemas_for_generation(4)
            .into_iter()
            .map(|s| s.function.name)
            .collect();
        assert!(at_2.iter().all(|n| at_4.contains(n)));
        assert_eq!(at_2.len(), 2);
        assert_eq!(at_4.len(), 3);
    }

    #[test]
    fn relative_paths_resolve_inside_workspace() {
        let dir = TempDir::new().unwrap();
        let resolution = resolve_path("notes/todo.md", dir.path());
        assert!(!resolution.was_absolute);
        assert!(!resolution.is_outside_workspace);
        assert_eq!(resolution.resolved, dir.path().join("notes/todo.md"));
        assert_eq!(resolution.note(), "");
    }

    #[test]
    fn absolute_paths_are_flagged() {
        let dir = TempDir::new().unwrap();
        let resolution = resolve_path("/etc/hosts", dir.path());
        assert!(resolution.was_absolute);
        assert!(resolution.is_outside_workspace);
        assert!(resolution.note().contains("/etc/hosts"));
    }
}
