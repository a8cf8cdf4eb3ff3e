//! Runtime assembly: builds every component once and owns shutdown.
//!
//! A [`Runtime`] is the single context object the binary works with. It
//! wires masker, audit logger, process managers, tool registry, executor,
//! and agent loop in dependency order, logs the session boundaries, and
//! tears everything down exactly once on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::agent::AgentLoop;
use crate::audit::{AuditEntry, AuditEventType, AuditLogger, SensitiveMasker};
use crate::config::Config;
use crate::exec::ToolExecutor;
use crate::llm::{LlmClient, OpenRouterClient};
use crate::process::{BackgroundProcessManager, PtySessionManager};
use crate::tools::{PermissionHandler, ToolRegistry};

pub struct Runtime {
    pub config: Config,
    pub session_id: String,
    pub audit: Arc<AuditLogger>,
    pub background: Arc<BackgroundProcessManager>,
    pub terminals: Arc<PtySessionManager>,
    pub registry: Arc<ToolRegistry>,
    pub executor: Arc<ToolExecutor>,
    pub agent: Arc<AgentLoop>,
    shut_down: AtomicBool,
}

impl Runtime {
    /// Build the full component graph for one session.
    pub async fn build(
        config: Config,
        permissions: Arc<dyn PermissionHandler>,
    ) -> anyhow::Result<Arc<Self>> {
        let llm: Arc<dyn LlmClient> = Arc::new(OpenRouterClient::new(config.api_key.clone()));
        Self::build_with_llm(config, permissions, llm).await
    }

    /// Like [`Runtime::build`] with an injected model client. Tests use this
    /// to drive the whole stack against a stub.
    pub async fn build_with_llm(
        config: Config,
        permissions: Arc<dyn PermissionHandler>,
        llm: Arc<dyn LlmClient>,
    ) -> anyhow::Result<Arc<Self>> {
        let session_id = uuid::Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(&config.workspace_path).await?;
        tokio::fs::create_dir_all(&config.state_dir).await?;

        let masker = Arc::new(SensitiveMasker::new());
        let audit = Arc::new(AuditLogger::new(
            config.audit_dir(),
            masker,
            config.audit_enabled,
        ));

        let background = BackgroundProcessManager::new(
            config.task_log_dir(),
            config.state_dir.join("background-tasks.json"),
            config.max_background_tasks,
            config.default_task_timeout_ms,
        )
        .await;
        let terminals = PtySessionManager::new(
            config.task_log_dir(),
            config.state_dir.join("pty-sessions.json"),
            config.max_terminal_sessions,
        )
        .await;

        let registry = Arc::new(ToolRegistry::builtin(
            Arc::clone(&background),
            Arc::clone(&terminals),
        ));
        let executor = Arc::new(ToolExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&audit),
            config.workspace_path.clone(),
        ));
        let agent = Arc::new(AgentLoop::new(
            llm,
            Arc::clone(&executor),
            Arc::clone(&registry),
            permissions,
            session_id.clone(),
            config.generation,
            config.default_model.clone(),
            config.max_iterations,
        ));

        audit
            .log(
                AuditEntry::new(AuditEventType::SessionStart, &session_id)
                    .output(format!("generation {}", config.generation)),
            )
            .await;
        tracing::info!(
            session_id = %session_id,
            generation = config.generation,
            workspace = %config.workspace_path.display(),
            "runtime ready"
        );

        Ok(Arc::new(Self {
            config,
            session_id,
            audit,
            background,
            terminals,
            registry,
            executor,
            agent,
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Tear down: kill children, flush recovery indexes, log session end.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(session_id = %self.session_id, "shutting down runtime");
        self.background.shutdown().await;
        self.terminals.shutdown().await;
        self.audit
            .log(AuditEntry::new(
                AuditEventType::SessionEnd,
                &self.session_id,
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentRequest;
    use crate::audit::AuditQuery;
    use crate::llm::{
        ChatMessage, ChatOptions, ChatResponse, FunctionCall, ToolCall, ToolDefinition,
    };
    use crate::tools::AllowAll;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Writes a file through a tool call, then answers.
    struct ScriptedLlm {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl crate::llm::LlmClient for ScriptedLlm {
        async fn chat_completion(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            tools: Option<&[ToolDefinition]>,
            _options: ChatOptions,
        ) -> anyhow::Result<ChatResponse> {
            // The registry advertises its built-ins to the model.
            assert!(tools
                .unwrap()
                .iter()
                .any(|t| t.function.name == "write_file"));
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(ChatResponse {
                    content: None,
                    tool_calls: Some(vec![ToolCall {
                        id: "c0".to_string(),
                        call_type: "function".to_string(),
                        function: FunctionCall {
                            name: "write_file".to_string(),
                            arguments:
                                "{\"path\": \"out.txt\", \"content\": \"from the agent\"}"
                                    .to_string(),
                        },
                    }]),
                    finish_reason: Some("tool_calls".to_string()),
                    usage: None,
                    model: None,
                })
            } else {
                Ok(ChatResponse {
                    content: Some("file written".to_string()),
                    tool_calls: None,
                    finish_reason: Some("stop".to_string()),
                    usage: None,
                    model: None,
                })
            }
        }
    }

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::new(
            "test-key".to_string(),
            "test-model".to_string(),
            dir.path().join("workspace"),
        );
        config.state_dir = dir.path().join("state");
        config
    }

    #[tokio::test]
    async fn end_to_end_turn_through_the_full_stack() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::build_with_llm(
            config(&dir),
            Arc::new(AllowAll),
            Arc::new(ScriptedLlm {
                calls: AtomicUsize::new(0),
            }),
        )
        .await
        .unwrap();

        let answer = runtime
            .agent
            .run(AgentRequest::new("write out.txt"))
            .await
            .unwrap();
        assert_eq!(answer, "file written");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("workspace/out.txt")).unwrap(),
            "from the agent"
        );

        // session_start plus the tool_usage entry are on disk
        let entries = runtime.audit.query(&AuditQuery::default()).await;
        assert!(entries
            .iter()
            .any(|e| e.event_type == AuditEventType::SessionStart));
        assert!(entries
            .iter()
            .any(|e| e.event_type == AuditEventType::ToolUsage));

        runtime.shutdown().await;
        let entries = runtime.audit.query(&AuditQuery::default()).await;
        assert!(entries
            .iter()
            .any(|e| e.event_type == AuditEventType::SessionEnd));

        // Idempotent: no second session_end
        runtime.shutdown().await;
        let again = runtime.audit.query(&AuditQuery::default()).await;
        assert_eq!(entries.len(), again.len());
    }
}
