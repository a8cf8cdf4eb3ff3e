//! OpenRouter API client with automatic retry and SSE streaming.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

use super::error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};
use super::{
    ChatMessage, ChatOptions, ChatResponse, ChatStream, ChatStreamEvent, FunctionCall, LlmClient,
    TokenUsage, ToolCall, ToolDefinition,
};

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// OpenRouter API client.
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    retry_config: RetryConfig,
}

impl OpenRouterClient {
    /// Create a new client with default retry configuration.
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            retry_config: RetryConfig::default(),
        }
    }

    /// Create a new client with custom retry configuration.
    pub fn with_retry_config(api_key: String, retry_config: RetryConfig) -> Self {
        Self {
            client: Client::new(),
            api_key,
            retry_config,
        }
    }

    fn request_builder(&self, request: &ChatRequest) -> reqwest::RequestBuilder {
        self.client
            .post(OPENROUTER_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
    }

    /// Parse a Retry-After header if present.
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok().map(Duration::from_secs))
    }

    fn create_error(
        status: reqwest::StatusCode,
        body: &str,
        retry_after: Option<Duration>,
    ) -> LlmError {
        let status_code = status.as_u16();
        match classify_http_status(status_code) {
            LlmErrorKind::RateLimited => LlmError::rate_limited(body.to_string(), retry_after),
            LlmErrorKind::ClientError => LlmError::client_error(status_code, body.to_string()),
            _ => LlmError::server_error(status_code, body.to_string()),
        }
    }

    /// Execute a single request without retry.
    async fn execute_request(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let response = match self.request_builder(request).send().await {
            Ok(r) => r,
            Err(e) => {
                if e.is_timeout() {
                    return Err(LlmError::network_error(format!("Request timeout: {}", e)));
                } else if e.is_connect() {
                    return Err(LlmError::network_error(format!("Connection failed: {}", e)));
                }
                return Err(LlmError::network_error(format!("Request failed: {}", e)));
            }
        };

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(Self::create_error(status, &body, retry_after));
        }

        let parsed: ApiResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, body))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::parse_error("No choices in response".to_string()))?;

        Ok(ChatResponse {
            content: choice.message.content,
            tool_calls: choice.message.tool_calls,
            finish_reason: choice.finish_reason,
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
            model: parsed.model.or_else(|| Some(request.model.clone())),
        })
    }

    /// Execute a request with automatic retry for transient errors.
    async fn execute_with_retry(&self, request: &ChatRequest) -> anyhow::Result<ChatResponse> {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            match self.execute_request(request).await {
                Ok(response) => {
                    if attempt > 0 {
                        tracing::info!(
                            retries = attempt,
                            elapsed = ?start.elapsed(),
                            "request succeeded after retries"
                        );
                    }
                    return Ok(response);
                }
                Err(error) => {
                    let should_retry = self.retry_config.should_retry(&error)
                        && attempt < self.retry_config.max_retries;

                    if !should_retry {
                        tracing::error!(attempts = attempt + 1, "request failed: {}", error);
                        return Err(anyhow::anyhow!("{}", error));
                    }

                    let delay = error.suggested_delay(attempt);
                    let remaining = self
                        .retry_config
                        .max_retry_duration
                        .saturating_sub(start.elapsed());
                    let actual_delay = delay.min(remaining);
                    if actual_delay.is_zero() {
                        tracing::warn!("retry budget exhausted: {}", error);
                        return Err(anyhow::anyhow!("{}", error));
                    }

                    tracing::warn!(
                        attempt = attempt + 1,
                        kind = %error.kind,
                        delay = ?actual_delay,
                        "retrying after transient error: {}",
                        error.message
                    );
                    tokio::time::sleep(actual_delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn build_request(
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        options: &ChatOptions,
        stream: bool,
    ) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            tools: tools.map(|t| t.to_vec()),
            tool_choice: tools.map(|_| "auto".to_string()),
            temperature: options.temperature,
            top_p: options.top_p,
            max_tokens: options.max_tokens,
            stream: if stream { Some(true) } else { None },
        }
    }
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        options: ChatOptions,
    ) -> anyhow::Result<ChatResponse> {
        let request = Self::build_request(model, messages, tools, &options, false);
        tracing::debug!(model, "sending chat completion request");
        self.execute_with_retry(&request).await
    }

    async fn chat_completion_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        options: ChatOptions,
    ) -> ChatStream {
        let request = Self::build_request(model, messages, tools, &options, true);
        let model = model.to_string();
        let builder = self.request_builder(&request);

        Box::pin(async_stream::try_stream! {
            let mut source = EventSource::new(builder)
                .map_err(|e| anyhow::anyhow!("failed to open event stream: {}", e))?;

            let mut assembly = StreamAssembly::new(model);

            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Open) => {}
                    Ok(Event::Message(msg)) => {
                        if msg.data.trim() == "[DONE]" {
                            break;
                        }
                        let chunk: StreamChunk = serde_json::from_str(&msg.data)
                            .map_err(|e| anyhow::anyhow!("bad stream chunk: {}: {}", e, msg.data))?;
                        if let Some(delta) = assembly.apply(chunk) {
                            if !delta.is_empty() {
                                yield ChatStreamEvent::TextDelta(delta);
                            }
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(e) => {
                        source.close();
                        Err(anyhow::anyhow!("event stream error: {}", e))?;
                    }
                }
            }
            source.close();

            yield ChatStreamEvent::Completed(assembly.finish());
        })
    }
}

/// Accumulates SSE deltas into a final [`ChatResponse`].
///
/// Tool-call fragments arrive indexed; the id/name come with the first
/// fragment and the argument string grows across chunks.
struct StreamAssembly {
    model: String,
    content: String,
    tool_calls: Vec<ToolCall>,
    finish_reason: Option<String>,
    usage: Option<TokenUsage>,
}

impl StreamAssembly {
    fn new(model: String) -> Self {
        Self {
            model,
            content: String::new(),
            tool_calls: Vec::new(),
            finish_reason: None,
            usage: None,
        }
    }

    /// Fold one chunk in; returns the text delta to surface, if any.
    fn apply(&mut self, chunk: StreamChunk) -> Option<String> {
        if let Some(usage) = chunk.usage {
            self.usage = Some(TokenUsage::new(usage.prompt_tokens, usage.completion_tokens));
        }
        let choice = chunk.choices.into_iter().next()?;
        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(reason);
        }

        if let Some(fragments) = choice.delta.tool_calls {
            for fragment in fragments {
                let index = fragment.index.unwrap_or(self.tool_calls.len());
                while self.tool_calls.len() <= index {
                    self.tool_calls.push(ToolCall {
                        id: String::new(),
                        call_type: "function".to_string(),
                        function: FunctionCall {
                            name: String::new(),
                            arguments: String::new(),
                        },
                    });
                }
                let slot = &mut self.tool_calls[index];
                if let Some(id) = fragment.id {
                    slot.id = id;
                }
                if let Some(function) = fragment.function {
                    if let Some(name) = function.name {
                        slot.function.name = name;
                    }
                    if let Some(arguments) = function.arguments {
                        slot.function.arguments.push_str(&arguments);
                    }
                }
            }
        }

        let delta = choice.delta.content?;
        self.content.push_str(&delta);
        Some(delta)
    }

    fn finish(self) -> ChatResponse {
        ChatResponse {
            content: if self.content.is_empty() {
                None
            } else {
                Some(self.content)
            },
            tool_calls: if self.tool_calls.is_empty() {
                None
            } else {
                Some(self.tool_calls)
            },
            finish_reason: self.finish_reason,
            usage: self.usage,
            model: Some(self.model),
        }
    }
}

/// OpenRouter API request format (OpenAI-compatible).
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// One SSE data chunk from a streaming completion.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallFragment {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionFragment>,
}

#[derive(Debug, Deserialize)]
struct FunctionFragment {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembly_accumulates_text_and_tool_fragments() {
        let mut assembly = StreamAssembly::new("test/model".to_string());

        let chunk: StreamChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(assembly.apply(chunk).as_deref(), Some("Hel"));

        let chunk: StreamChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"read_file","arguments":"{\"pa"}}]},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert!(assembly.apply(chunk).is_none());

        let chunk: StreamChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"th\":\"a\"}"}}]},"finish_reason":"tool_calls"}]}"#,
        )
        .unwrap();
        assembly.apply(chunk);

        let response = assembly.finish();
        assert_eq!(response.content.as_deref(), Some("Hel"));
        let calls = response.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "read_file");
        assert_eq!(calls[0].function.arguments, r#"{"path":"a"}"#);
        assert_eq!(response.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn empty_assembly_finishes_clean() {
        let response = StreamAssembly::new("m".to_string()).finish();
        assert!(response.content.is_none());
        assert!(response.tool_calls.is_none());
    }
}
