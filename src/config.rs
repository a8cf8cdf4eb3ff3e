//! Configuration management for agentd.
//!
//! Configuration can be set via environment variables:
//! - `OPENROUTER_API_KEY` - Required for live runs. Your OpenRouter API key.
//! - `DEFAULT_MODEL` - Optional. The default LLM model to use.
//! - `WORKSPACE_PATH` - Optional. The workspace directory. Defaults to current directory.
//! - `AGENTD_STATE_DIR` - Optional. State directory (audit logs, task logs,
//!   crash-recovery indexes). Defaults to `~/.agentd`.
//! - `AGENTD_GENERATION` - Optional. Active capability generation (1-8). Defaults to `8`.
//! - `MAX_ITERATIONS` - Optional. Maximum agent loop iterations. Defaults to `10`.
//! - `MAX_BACKGROUND_TASKS` - Optional. Concurrent background task cap. Defaults to `10`.
//! - `MAX_TERMINAL_SESSIONS` - Optional. Concurrent PTY session cap. Defaults to `10`.
//! - `DEFAULT_TASK_TIMEOUT_MS` - Optional. Default max runtime for spawned
//!   processes. Defaults to `300000` (5 minutes).
//! - `AUDIT_ENABLED` - Optional. Set to `false` to disable the audit trail.

use std::path::PathBuf;
use thiserror::Error;

use crate::util::{env_var_bool, home_dir};

/// Highest capability generation the runtime knows about.
pub const MAX_GENERATION: u8 = 8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenRouter API key
    pub api_key: String,

    /// Default LLM model identifier (OpenRouter format)
    pub default_model: String,

    /// Workspace directory for file operations
    pub workspace_path: PathBuf,

    /// State directory holding audit logs, task logs and recovery indexes
    pub state_dir: PathBuf,

    /// Active capability generation for this session (1-8)
    pub generation: u8,

    /// Maximum iterations for the agent loop
    pub max_iterations: usize,

    /// Hard cap on concurrently tracked background tasks
    pub max_background_tasks: usize,

    /// Hard cap on concurrently tracked PTY sessions
    pub max_terminal_sessions: usize,

    /// Default max runtime for spawned processes, in milliseconds
    pub default_task_timeout_ms: u64,

    /// Whether the audit trail is enabled
    pub audit_enabled: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `OPENROUTER_API_KEY` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))?;

        let default_model = std::env::var("DEFAULT_MODEL")
            .unwrap_or_else(|_| "anthropic/claude-sonnet-4.5".to_string());

        let workspace_path = std::env::var("WORKSPACE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let state_dir = std::env::var("AGENTD_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(home_dir()).join(".agentd"));

        let generation = parse_env("AGENTD_GENERATION", MAX_GENERATION)?;
        if generation == 0 || generation > MAX_GENERATION {
            return Err(ConfigError::InvalidValue(
                "AGENTD_GENERATION".to_string(),
                format!("must be between 1 and {}", MAX_GENERATION),
            ));
        }

        let max_iterations = parse_env("MAX_ITERATIONS", 10usize)?;
        let max_background_tasks = parse_env("MAX_BACKGROUND_TASKS", 10usize)?;
        let max_terminal_sessions = parse_env("MAX_TERMINAL_SESSIONS", 10usize)?;
        let default_task_timeout_ms = parse_env("DEFAULT_TASK_TIMEOUT_MS", 300_000u64)?;
        let audit_enabled = env_var_bool("AUDIT_ENABLED", true);

        Ok(Self {
            api_key,
            default_model,
            workspace_path,
            state_dir,
            generation,
            max_iterations,
            max_background_tasks,
            max_terminal_sessions,
            default_task_timeout_ms,
            audit_enabled,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, default_model: String, workspace_path: PathBuf) -> Self {
        Self {
            api_key,
            default_model,
            workspace_path,
            state_dir: PathBuf::from(home_dir()).join(".agentd"),
            generation: MAX_GENERATION,
            max_iterations: 10,
            max_background_tasks: 10,
            max_terminal_sessions: 10,
            default_task_timeout_ms: 300_000,
            audit_enabled: true,
        }
    }

    /// Directory holding day-partitioned audit logs.
    pub fn audit_dir(&self) -> PathBuf {
        self.state_dir.join("audit")
    }

    /// Directory holding per-task/session sidecar output logs.
    pub fn task_log_dir(&self) -> PathBuf {
        self.state_dir.join("task-logs")
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}
