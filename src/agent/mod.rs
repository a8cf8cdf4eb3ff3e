//! The agent loop: interleaves model responses with tool execution.
//!
//! One turn works like this: send the conversation to the model with the
//! tool schemas the session's generation allows; if the model answers with
//! tool calls, run each through the [`ToolExecutor`] and fold the results
//! back as tool messages; repeat until the model answers with plain text or
//! the iteration budget runs out. The loop holds no permission or audit
//! logic, that all lives behind the executor.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;

use crate::exec::ToolExecutor;
use crate::llm::{
    ChatMessage, ChatOptions, ChatResponse, ChatStreamEvent, LlmClient, Role, ToolCall,
};
use crate::tools::{ExecutionContext, PermissionHandler, ToolRegistry};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a capable coding assistant operating in a local \
workspace. Use the available tools to inspect files, run commands, and manage background \
processes as needed, and answer with plain text when you are done.";

/// Returned when the model is still asking for tools at the iteration cap.
const BUDGET_EXHAUSTED_MESSAGE: &str =
    "Task did not finish within the allowed number of steps. Partial work may exist; \
ask me to continue if you want me to keep going.";

/// A single agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            model: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Incremental events emitted by [`AgentLoop::stream`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A chunk of assistant text.
    Text { delta: String },
    /// The model requested a tool invocation.
    ToolUse {
        id: String,
        name: String,
        args: Value,
    },
    /// A tool invocation finished.
    ToolResult {
        id: String,
        name: String,
        success: bool,
        output: String,
    },
    /// Terminal: the turn completed normally.
    Done { final_text: String },
    /// Terminal: the turn aborted.
    Error { message: String },
}

pub struct AgentLoop {
    llm: Arc<dyn LlmClient>,
    executor: Arc<ToolExecutor>,
    registry: Arc<ToolRegistry>,
    permissions: Arc<dyn PermissionHandler>,
    session_id: String,
    generation: u8,
    default_model: String,
    max_iterations: usize,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        executor: Arc<ToolExecutor>,
        registry: Arc<ToolRegistry>,
        permissions: Arc<dyn PermissionHandler>,
        session_id: impl Into<String>,
        generation: u8,
        default_model: impl Into<String>,
        max_iterations: usize,
    ) -> Self {
        Self {
            llm,
            executor,
            registry,
            permissions,
            session_id: session_id.into(),
            generation,
            default_model: default_model.into(),
            max_iterations,
        }
    }

    fn context(&self) -> ExecutionContext {
        ExecutionContext {
            working_dir: self.executor.working_dir_handle(),
            session_id: self.session_id.clone(),
            generation: self.generation,
            permissions: Arc::clone(&self.permissions),
            events: None,
        }
    }

    fn initial_messages(&self, request: &AgentRequest) -> Vec<ChatMessage> {
        let system = request
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        vec![
            ChatMessage::new(Role::System, system),
            ChatMessage::new(Role::User, request.prompt.clone()),
        ]
    }

    fn options(&self, request: &AgentRequest) -> ChatOptions {
        ChatOptions {
            temperature: request.temperature,
            top_p: None,
            max_tokens: request.max_tokens,
        }
    }

    fn assistant_message(response: &ChatResponse) -> ChatMessage {
        ChatMessage {
            role: Role::Assistant,
            content: response.content.clone(),
            tool_calls: response.tool_calls.clone(),
            tool_call_id: None,
        }
    }

    fn parse_args(call: &ToolCall) -> Value {
        serde_json::from_str(&call.function.arguments)
            .unwrap_or_else(|_| Value::Object(Default::default()))
    }

    async fn run_tool_call(&self, call: &ToolCall, ctx: &ExecutionContext) -> (Value, String, bool) {
        let args = Self::parse_args(call);
        tracing::debug!(tool = %call.function.name, call_id = %call.id, "executing tool call");
        let result = self
            .executor
            .execute(&call.function.name, args.clone(), ctx)
            .await;
        (args, result.as_tool_message(), result.success)
    }

    /// Run one turn to completion and return the final assistant text.
    pub async fn run(&self, request: AgentRequest) -> anyhow::Result<String> {
        let model = request.model.clone().unwrap_or_else(|| self.default_model.clone());
        let options = self.options(&request);
        let mut messages = self.initial_messages(&request);
        let schemas = self.registry.schemas_for_generation(self.generation);
        let ctx = self.context();

        for iteration in 1..=self.max_iterations {
            tracing::debug!(iteration, message_count = messages.len(), "agent iteration");
            let response = self
                .llm
                .chat_completion(&model, &messages, Some(&schemas), options.clone())
                .await?;

            if !response.has_tool_calls() {
                return Ok(response.content.unwrap_or_default());
            }

            messages.push(Self::assistant_message(&response));
            for call in response.tool_calls.as_deref().unwrap_or(&[]) {
                let (_, output, _) = self.run_tool_call(call, &ctx).await;
                messages.push(ChatMessage::tool_result(call.id.clone(), output));
            }
        }

        tracing::warn!(max_iterations = self.max_iterations, "iteration budget exhausted");
        Ok(BUDGET_EXHAUSTED_MESSAGE.to_string())
    }

    /// Run one turn, emitting incremental [`AgentEvent`]s. The stream always
    /// ends with exactly one `Done` or `Error` event.
    pub fn stream(
        self: Arc<Self>,
        request: AgentRequest,
    ) -> impl Stream<Item = AgentEvent> + Send {
        async_stream::stream! {
            let model = request.model.clone().unwrap_or_else(|| self.default_model.clone());
            let options = self.options(&request);
            let mut messages = self.initial_messages(&request);
            let schemas = self.registry.schemas_for_generation(self.generation);
            let ctx = self.context();
            let mut final_text = String::new();

            for _iteration in 1..=self.max_iterations {
                let mut chat_stream = self
                    .llm
                    .chat_completion_stream(&model, &messages, Some(&schemas), options.clone())
                    .await;

                let mut completed: Option<ChatResponse> = None;
                while let Some(event) = chat_stream.next().await {
                    match event {
                        Ok(ChatStreamEvent::TextDelta(delta)) => {
                            final_text.push_str(&delta);
                            yield AgentEvent::Text { delta };
                        }
                        Ok(ChatStreamEvent::Completed(response)) => {
                            completed = Some(response);
                        }
                        Err(e) => {
                            yield AgentEvent::Error { message: e.to_string() };
                            return;
                        }
                    }
                }

                let Some(response) = completed else {
                    yield AgentEvent::Error {
                        message: "model stream ended without a completion".to_string(),
                    };
                    return;
                };

                if !response.has_tool_calls() {
                    let text = response.content.unwrap_or(final_text);
                    yield AgentEvent::Done { final_text: text };
                    return;
                }

                messages.push(Self::assistant_message(&response));
                final_text.clear();
                for call in response.tool_calls.as_deref().unwrap_or(&[]) {
                    // Announce the call before running it so a consumer sees
                    // long tool executions as they start.
                    yield AgentEvent::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        args: Self::parse_args(call),
                    };
                    let (_args, output, success) = self.run_tool_call(call, &ctx).await;
                    yield AgentEvent::ToolResult {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        success,
                        output: output.clone(),
                    };
                    messages.push(ChatMessage::tool_result(call.id.clone(), output));
                }
            }

            yield AgentEvent::Done {
                final_text: BUDGET_EXHAUSTED_MESSAGE.to_string(),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLogger, SensitiveMasker};
    use crate::llm::{FunctionCall, ToolDefinition};
    use crate::tools::{AllowAll, Tool};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "repeats its input"
        }
        fn parameters_schema(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(
            &self,
            args: Value,
            _ctx: &ExecutionContext,
        ) -> anyhow::Result<String> {
            Ok(format!("echo: {}", args["text"].as_str().unwrap_or("")))
        }
    }

    /// Keeps asking for the echo tool, never produces a final answer.
    struct AlwaysToolCalling {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for AlwaysToolCalling {
        async fn chat_completion(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _tools: Option<&[ToolDefinition]>,
            _options: ChatOptions,
        ) -> anyhow::Result<ChatResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChatResponse {
                content: None,
                tool_calls: Some(vec![ToolCall {
                    id: format!("call-{}", n),
                    call_type: "function".to_string(),
                    function: FunctionCall {
                        name: "echo".to_string(),
                        arguments: "{\"text\": \"again\"}".to_string(),
                    },
                }]),
                finish_reason: Some("tool_calls".to_string()),
                usage: None,
                model: None,
            })
        }
    }

    /// One tool call, then a text answer.
    struct OneToolThenAnswer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for OneToolThenAnswer {
        async fn chat_completion(
            &self,
            _model: &str,
            messages: &[ChatMessage],
            _tools: Option<&[ToolDefinition]>,
            _options: ChatOptions,
        ) -> anyhow::Result<ChatResponse> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(ChatResponse {
                    content: None,
                    tool_calls: Some(vec![ToolCall {
                        id: "call-0".to_string(),
                        call_type: "function".to_string(),
                        function: FunctionCall {
                            name: "echo".to_string(),
                            arguments: "{\"text\": \"ping\"}".to_string(),
                        },
                    }]),
                    finish_reason: Some("tool_calls".to_string()),
                    usage: None,
                    model: None,
                })
            } else {
                // The tool result must have been folded back by now.
                let saw_tool_result = messages
                    .iter()
                    .any(|m| m.role == Role::Tool && m.content.as_deref() == Some("echo: ping"));
                assert!(saw_tool_result, "tool result missing from conversation");
                Ok(ChatResponse {
                    content: Some("all done".to_string()),
                    tool_calls: None,
                    finish_reason: Some("stop".to_string()),
                    usage: None,
                    model: None,
                })
            }
        }
    }

    fn agent(dir: &TempDir, llm: Arc<dyn LlmClient>, max_iterations: usize) -> Arc<AgentLoop> {
        let mut registry = ToolRegistry::empty();
        registry.register(Arc::new(Echo)).unwrap();
        let registry = Arc::new(registry);
        let audit = Arc::new(AuditLogger::new(
            dir.path().join("audit"),
            Arc::new(SensitiveMasker::new()),
            true,
        ));
        let executor = Arc::new(ToolExecutor::new(
            Arc::clone(&registry),
            audit,
            dir.path().to_path_buf(),
        ));
        Arc::new(AgentLoop::new(
            llm,
            executor,
            registry,
            Arc::new(AllowAll),
            "agent-test",
            8,
            "test-model",
            max_iterations,
        ))
    }

    #[tokio::test]
    async fn tool_results_fold_back_into_the_conversation() {
        let dir = TempDir::new().unwrap();
        let agent = agent(
            &dir,
            Arc::new(OneToolThenAnswer {
                calls: AtomicUsize::new(0),
            }),
            10,
        );
        let answer = agent.run(AgentRequest::new("do the thing")).await.unwrap();
        assert_eq!(answer, "all done");
    }

    #[tokio::test]
    async fn iteration_budget_yields_the_conservative_message() {
        let dir = TempDir::new().unwrap();
        let llm = Arc::new(AlwaysToolCalling {
            calls: AtomicUsize::new(0),
        });
        let agent = agent(&dir, Arc::clone(&llm) as Arc<dyn LlmClient>, 3);

        let answer = agent.run(AgentRequest::new("never ends")).await.unwrap();
        assert_eq!(answer, BUDGET_EXHAUSTED_MESSAGE);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stream_announces_tool_use_before_the_tool_runs() {
        use std::sync::atomic::AtomicBool;

        struct MarkingEcho {
            ran: Arc<AtomicBool>,
        }

        #[async_trait]
        impl Tool for MarkingEcho {
            fn name(&self) -> &str {
                "echo"
            }
            fn description(&self) -> &str {
                "repeats its input"
            }
            fn parameters_schema(&self) -> Value {
                serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
            }
            async fn execute(
                &self,
                args: Value,
                _ctx: &ExecutionContext,
            ) -> anyhow::Result<String> {
                self.ran.store(true, Ordering::SeqCst);
                Ok(format!("echo: {}", args["text"].as_str().unwrap_or("")))
            }
        }

        let dir = TempDir::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let mut registry = ToolRegistry::empty();
        registry
            .register(Arc::new(MarkingEcho {
                ran: Arc::clone(&ran),
            }))
            .unwrap();
        let registry = Arc::new(registry);
        let audit = Arc::new(AuditLogger::new(
            dir.path().join("audit"),
            Arc::new(SensitiveMasker::new()),
            true,
        ));
        let executor = Arc::new(ToolExecutor::new(
            Arc::clone(&registry),
            audit,
            dir.path().to_path_buf(),
        ));
        let agent = Arc::new(AgentLoop::new(
            Arc::new(OneToolThenAnswer {
                calls: AtomicUsize::new(0),
            }),
            executor,
            registry,
            Arc::new(AllowAll),
            "agent-test",
            8,
            "test-model",
            10,
        ));

        let stream = agent.stream(AgentRequest::new("go"));
        futures::pin_mut!(stream);
        loop {
            match stream.next().await.expect("stream ended early") {
                AgentEvent::ToolUse { name, .. } => {
                    assert_eq!(name, "echo");
                    assert!(!ran.load(Ordering::SeqCst), "tool ran before it was announced");
                    break;
                }
                AgentEvent::ToolResult { .. } => panic!("tool result before its announcement"),
                _ => {}
            }
        }
        let mut saw_result = false;
        while let Some(event) = stream.next().await {
            if matches!(event, AgentEvent::ToolResult { .. }) {
                assert!(ran.load(Ordering::SeqCst));
                saw_result = true;
            }
        }
        assert!(saw_result);
    }

    #[tokio::test]
    async fn stream_ends_with_exactly_one_terminal_event() {
        let dir = TempDir::new().unwrap();
        let agent = agent(
            &dir,
            Arc::new(OneToolThenAnswer {
                calls: AtomicUsize::new(0),
            }),
            10,
        );

        let events: Vec<AgentEvent> = agent.stream(AgentRequest::new("go")).collect().await;
        let terminal: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::Done { .. } | AgentEvent::Error { .. }))
            .collect();
        assert_eq!(terminal.len(), 1);
        assert!(matches!(events.last(), Some(AgentEvent::Done { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolUse { name, .. } if name == "echo")));
        assert!(events.iter().any(
            |e| matches!(e, AgentEvent::ToolResult { success: true, output, .. } if output == "echo: ping")
        ));
    }

    #[tokio::test]
    async fn streaming_budget_exhaustion_is_a_done_event() {
        let dir = TempDir::new().unwrap();
        let agent = agent(
            &dir,
            Arc::new(AlwaysToolCalling {
                calls: AtomicUsize::new(0),
            }),
            2,
        );

        let events: Vec<AgentEvent> = agent.stream(AgentRequest::new("loop")).collect().await;
        assert!(matches!(
            events.last(),
            Some(AgentEvent::Done { final_text }) if final_text == BUDGET_EXHAUSTED_MESSAGE
        ));
    }
}
