use crate::conversation::Message;
use crate::stream::StreamEvent;
use crate::tool::ToolDefinition;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Boxed event stream returned by [`ToolAwareLlmProvider::stream_with_tools`].
///
/// Dropping the stream aborts the underlying request.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

/// Trait for LLM providers that support tool use and streaming.
///
/// This trait lives in tool-runtime (not in crates/llm) because it's
/// defined by the consumer (the conversation engine), not the provider.
/// Implementations live in crates/llm.
#[async_trait]
pub trait ToolAwareLlmProvider: Send + Sync {
    /// Stream a response from the LLM with tool definitions available.
    ///
    /// `messages` only ever contains user and assistant turns.
    async fn stream_with_tools(
        &self,
        messages: Vec<Message>,
        system_prompt: Option<String>,
        tools: Vec<ToolDefinition>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<EventStream, LlmError>;

    /// Non-streaming convenience: collects the full response.
    async fn complete_with_tools(
        &self,
        messages: Vec<Message>,
        system_prompt: Option<String>,
        tools: Vec<ToolDefinition>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Vec<StreamEvent>, LlmError> {
        use futures::StreamExt;
        let stream = self
            .stream_with_tools(messages, system_prompt, tools, temperature, max_tokens)
            .await?;
        let events: Vec<_> = stream
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Provider name for logging/debugging (e.g., "claude")
    fn provider_name(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("Authentication failed")]
    AuthError,
    #[error("Stream error: {0}")]
    StreamError(String),
    #[error("Provider not configured: {0}")]
    NotConfigured(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LlmError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }
}

/// Mock LLM provider for testing the conversation engine without real API calls.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use crate::stream::StopReason;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// A scripted failure. `LlmError` is not `Clone`, so scripts hold this instead.
    #[derive(Debug, Clone)]
    pub enum MockFailure {
        RateLimited,
        Network(String),
    }

    impl MockFailure {
        fn to_error(&self) -> LlmError {
            match self {
                MockFailure::RateLimited => LlmError::RateLimited {
                    retry_after_secs: 30,
                },
                MockFailure::Network(msg) => LlmError::NetworkError(msg.clone()),
            }
        }
    }

    enum Reply {
        Stream(Vec<Result<StreamEvent, MockFailure>>),
        Refuse(MockFailure),
    }

    /// A mock provider that returns pre-configured responses in FIFO order.
    ///
    /// When the queue is empty it answers with an empty `EndTurn` message.
    pub struct MockLlmProvider {
        responses: Mutex<VecDeque<Reply>>,
        requests: Mutex<Vec<Vec<Message>>>,
    }

    impl MockLlmProvider {
        pub fn new() -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Queue a response that will be returned after everything queued before it.
        pub fn queue_response(&self, events: Vec<StreamEvent>) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Reply::Stream(events.into_iter().map(Ok).collect()));
        }

        /// Queue a simple text response.
        pub fn queue_text(&self, text: &str) {
            self.queue_response(vec![
                StreamEvent::text(text),
                StreamEvent::end(StopReason::EndTurn),
            ]);
        }

        /// Queue a single tool call whose arguments arrive in the given fragments.
        pub fn queue_tool_call(&self, id: &str, name: &str, fragments: &[&str]) {
            let mut events = vec![StreamEvent::ToolCallStart {
                id: id.to_string(),
                name: name.to_string(),
            }];
            events.extend(fragments.iter().map(|f| StreamEvent::ToolCallDelta {
                id: id.to_string(),
                arguments_delta: f.to_string(),
            }));
            events.push(StreamEvent::ToolCallEnd { id: id.to_string() });
            events.push(StreamEvent::end(StopReason::ToolUse));
            self.queue_response(events);
        }

        /// Fail at stream creation.
        pub fn queue_refusal(&self, failure: MockFailure) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Reply::Refuse(failure));
        }

        /// Emit some events, then fail mid-stream.
        pub fn queue_failing_stream(&self, events: Vec<StreamEvent>, failure: MockFailure) {
            let mut items: Vec<Result<StreamEvent, MockFailure>> =
                events.into_iter().map(Ok).collect();
            items.push(Err(failure));
            self.responses
                .lock()
                .unwrap()
                .push_back(Reply::Stream(items));
        }

        /// Number of `stream_with_tools` calls made so far.
        pub fn call_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        /// Message lists received, one entry per call.
        pub fn requests(&self) -> Vec<Vec<Message>> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Default for MockLlmProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ToolAwareLlmProvider for MockLlmProvider {
        async fn stream_with_tools(
            &self,
            messages: Vec<Message>,
            _system_prompt: Option<String>,
            _tools: Vec<ToolDefinition>,
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<EventStream, LlmError> {
            self.requests.lock().unwrap().push(messages);
            let reply = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Reply::Stream(vec![Ok(StreamEvent::end(StopReason::EndTurn))])
                });
            match reply {
                Reply::Refuse(failure) => Err(failure.to_error()),
                Reply::Stream(items) => Ok(Box::pin(stream::iter(
                    items
                        .into_iter()
                        .map(|item| item.map_err(|f| f.to_error())),
                ))),
            }
        }

        fn provider_name(&self) -> &str {
            "mock"
        }
    }
}
