//! [`ToolAwareLlmProvider`] trait implementation for the Claude streaming API.

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use serde_json::{json, Value};
use tracing::{debug, warn};

use toolbridge_runtime::{
    conversation::Message,
    provider::{EventStream, LlmError, ToolAwareLlmProvider},
    stream::StreamEvent,
    tool::ToolDefinition,
};

use super::sse::{ClaudeEventDecoder, DEFAULT_RETRY_AFTER_SECS};
use super::translate::{messages_to_claude, tool_definition_to_claude};

/// Claude (Anthropic) provider with streaming tool-use support.
///
/// Uses the Anthropic Messages API (`/v1/messages`) with `stream: true` to emit
/// incremental [`StreamEvent`]s that the conversation engine consumes.
pub struct ClaudeToolProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl ClaudeToolProvider {
    /// Create a new Claude tool provider.
    ///
    /// # Arguments
    /// * `api_key` - Anthropic API key
    /// * `model` - Model name (e.g. `"claude-sonnet-4-5-20250929"`)
    /// * `base_url` - API base URL (e.g. `"https://api.anthropic.com"`)
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Create a provider with sensible defaults.
    pub fn with_defaults(api_key: String) -> Self {
        Self::new(
            api_key,
            "claude-sonnet-4-5-20250929".to_string(),
            "https://api.anthropic.com".to_string(),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(
        &self,
        messages: &[Message],
        system_prompt: Option<&str>,
        tools: &[ToolDefinition],
        temperature: f32,
        max_tokens: u32,
    ) -> Value {
        let api_tools: Vec<Value> = tools.iter().map(tool_definition_to_claude).collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages_to_claude(messages),
            "temperature": temperature,
            "max_tokens": max_tokens,
            "stream": true,
        });

        if !api_tools.is_empty() {
            body["tools"] = json!(api_tools);
        }

        if let Some(system) = system_prompt {
            body["system"] = json!(system);
        }
        body
    }
}

/// Map a non-200 response to an [`LlmError`].
///
/// A 429 takes its retry hint from the `retry-after` header, then from the
/// body, then falls back to a default.
pub(super) fn error_for_status(status: u16, retry_after_header: Option<u64>, body: &str) -> LlmError {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let error_type = parsed
        .as_ref()
        .and_then(|v| v["error"]["type"].as_str())
        .unwrap_or("");

    if status == 401 {
        return LlmError::AuthError;
    }
    if status == 429 || error_type == "rate_limit_error" {
        let retry_after_secs = retry_after_header
            .or_else(|| {
                parsed
                    .as_ref()
                    .and_then(|v| v["error"]["retry_after_secs"].as_u64())
            })
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
        return LlmError::RateLimited { retry_after_secs };
    }
    LlmError::ApiError {
        status,
        message: body.to_string(),
    }
}

#[async_trait]
impl ToolAwareLlmProvider for ClaudeToolProvider {
    async fn stream_with_tools(
        &self,
        messages: Vec<Message>,
        system_prompt: Option<String>,
        tools: Vec<ToolDefinition>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<EventStream, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.request_body(
            &messages,
            system_prompt.as_deref(),
            &tools,
            temperature,
            max_tokens,
        );

        debug!(model = %self.model, url = %url, tools = tools.len(), "starting Claude streaming request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        let status = response.status().as_u16();

        if status != 200 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body_text = response.text().await.unwrap_or_default();
            let err = error_for_status(status, retry_after, &body_text);
            warn!(status, error = %err, "Claude request rejected");
            return Err(err);
        }

        type ByteStream =
            Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

        struct State {
            bytes: ByteStream,
            decoder: ClaudeEventDecoder,
            pending: VecDeque<Result<StreamEvent, LlmError>>,
            finished: bool,
        }

        let state = State {
            bytes: Box::pin(response.bytes_stream()),
            decoder: ClaudeEventDecoder::new(),
            pending: VecDeque::new(),
            finished: false,
        };

        let event_stream = stream::unfold(state, |mut state| async move {
            use futures::StreamExt;
            loop {
                if let Some(item) = state.pending.pop_front() {
                    // An error ends the stream.
                    if item.is_err() {
                        state.pending.clear();
                        state.finished = true;
                    }
                    return Some((item, state));
                }
                if state.finished {
                    return None;
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        let decoded = state.decoder.feed(&chunk);
                        state.pending.extend(decoded);
                    }
                    Some(Err(e)) => {
                        state.finished = true;
                        return Some((Err(LlmError::StreamError(e.to_string())), state));
                    }
                    None => {
                        let decoded = state.decoder.finish();
                        state.pending.extend(decoded);
                        state.finished = true;
                    }
                }
            }
        });

        Ok(Box::pin(event_stream))
    }

    fn provider_name(&self) -> &str {
        "claude"
    }
}
