//! Tool execution pipeline: gating, fault containment, audit.
//!
//! Every tool invocation in the system goes through [`ToolExecutor::execute`],
//! which never returns `Err` and never lets a panic escape. The outcome is
//! always a structured [`ExecutionResult`] the agent loop can fold back into
//! the conversation, and every call leaves exactly one `tool_usage` audit
//! entry behind.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::audit::{AuditEntry, AuditEventType, AuditLogger, RiskLevel};
use crate::tools::{ExecutionContext, ToolRegistry};

/// Structured outcome of one tool invocation.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub metadata: HashMap<String, Value>,
}

impl ExecutionResult {
    fn ok(output: String) -> Self {
        Self {
            success: true,
            output,
            error: None,
            metadata: HashMap::new(),
        }
    }

    fn fail(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            output: String::new(),
            error: Some(error),
            metadata: HashMap::new(),
        }
    }

    fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// The string the agent loop folds back as the tool's result message.
    pub fn as_tool_message(&self) -> String {
        if self.success {
            self.output.clone()
        } else {
            format!(
                "Error: {}",
                self.error.as_deref().unwrap_or("unknown failure")
            )
        }
    }
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    audit: Arc<AuditLogger>,
    working_dir: Arc<RwLock<PathBuf>>,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        audit: Arc<AuditLogger>,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            audit,
            working_dir: Arc::new(RwLock::new(working_dir)),
        }
    }

    /// Shared handle to the working directory; contexts built from it see
    /// directory changes made between calls.
    pub fn working_dir_handle(&self) -> Arc<RwLock<PathBuf>> {
        Arc::clone(&self.working_dir)
    }

    pub async fn set_working_directory(&self, dir: PathBuf) {
        *self.working_dir.write().await = dir;
    }

    /// Execute `tool_name` under the given context.
    ///
    /// Pipeline: registry lookup, generation gate, permission gate, timed
    /// execution with panic containment, audit. A gated-out or failed call
    /// comes back as `success: false`; only the permission gate also records
    /// a `security_incident`.
    pub async fn execute(
        &self,
        tool_name: &str,
        args: Value,
        ctx: &ExecutionContext,
    ) -> ExecutionResult {
        let started = Instant::now();

        let tool = match self.registry.lookup(tool_name) {
            Some(tool) => tool,
            None => {
                let result = ExecutionResult::fail(format!("Unknown tool: {}", tool_name));
                self.audit_usage(tool_name, &args, ctx, &result, started)
                    .await;
                return result;
            }
        };

        if !self
            .registry
            .available_in_generation(tool_name, ctx.generation)
        {
            let result = ExecutionResult::fail(format!(
                "{} not available in this generation",
                tool_name
            ));
            self.audit_usage(tool_name, &args, ctx, &result, started)
                .await;
            return result;
        }

        if tool.requires_permission() {
            let allowed = ctx
                .permissions
                .allow(tool_name, tool.permission_level(), &args)
                .await;
            if !allowed {
                tracing::warn!(tool = %tool_name, session_id = %ctx.session_id, "permission denied");
                self.audit
                    .log(
                        AuditEntry::new(AuditEventType::SecurityIncident, &ctx.session_id)
                            .tool(tool_name)
                            .input(args.to_string())
                            .success(false)
                            .error("Permission denied")
                            .flag("permission_denied")
                            .risk(RiskLevel::High),
                    )
                    .await;
                let result = ExecutionResult::fail("Permission denied");
                self.audit_usage(tool_name, &args, ctx, &result, started)
                    .await;
                return result;
            }
        }

        let invocation = AssertUnwindSafe(tool.execute(args.clone(), ctx)).catch_unwind();
        let result = match invocation.await {
            Ok(Ok(output)) => ExecutionResult::ok(output),
            Ok(Err(e)) => ExecutionResult::fail(e.to_string()),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(tool = %tool_name, panic = %detail, "tool panicked");
                ExecutionResult::fail(format!("Tool panicked: {}", detail))
            }
        }
        .with_meta(
            "duration_ms",
            Value::from(started.elapsed().as_millis() as u64),
        );

        self.audit_usage(tool_name, &args, ctx, &result, started)
            .await;
        result
    }

    async fn audit_usage(
        &self,
        tool_name: &str,
        args: &Value,
        ctx: &ExecutionContext,
        result: &ExecutionResult,
        started: Instant,
    ) {
        let mut entry = AuditEntry::new(AuditEventType::ToolUsage, &ctx.session_id)
            .tool(tool_name)
            .input(args.to_string())
            .output(result.output.clone())
            .duration_ms(started.elapsed().as_millis() as u64)
            .success(result.success);
        if let Some(ref error) = result.error {
            entry = entry.error(error.clone());
        }
        self.audit.log(entry).await;
    }
}
