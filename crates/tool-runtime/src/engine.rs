use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use toolbridge_core::Config;

use crate::backend::ToolBackend;
use crate::catalog::{ToolCatalog, DEFAULT_CATALOG_TIMEOUT};
use crate::conversation::ConversationHistory;
use crate::error::BridgeError;
use crate::invocation::ToolInvocation;
use crate::notification::Notification;
use crate::policy::{ArgumentPolicy, MessagePreamble, NoPreamble, TurnMessages};
use crate::provider::ToolAwareLlmProvider;
use crate::stream::StreamEvent;

/// Settings for one conversation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Highest recursion depth reached before the turn is cut off.
    pub max_depth: usize,
    pub tool_timeout: Duration,
    pub catalog_timeout: Duration,
    pub argument_policy: ArgumentPolicy,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub messages: TurnMessages,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 4,
            tool_timeout: DEFAULT_CATALOG_TIMEOUT,
            catalog_timeout: DEFAULT_CATALOG_TIMEOUT,
            argument_policy: ArgumentPolicy::Lenient,
            system_prompt: None,
            temperature: 0.0,
            max_tokens: 4096,
            messages: TurnMessages::default(),
        }
    }
}

impl EngineConfig {
    /// Engine settings from the `engine`, `llm` and `tool_provider` sections.
    /// An unknown argument policy falls back to lenient.
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_depth: config.engine.max_depth as usize,
            tool_timeout: config.tool_provider.request_timeout(),
            catalog_timeout: config.engine.catalog_timeout(),
            argument_policy: config
                .engine
                .argument_policy
                .parse::<ArgumentPolicy>()
                .unwrap_or_default(),
            system_prompt: config.llm.system_prompt.clone(),
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
            ..Self::default()
        }
    }
}

/// What happened during one `send_message` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TurnSummary {
    pub model_calls: usize,
    pub tool_calls: usize,
    /// Recursion depth reached.
    pub depth: usize,
    pub rate_limited: bool,
    pub depth_exceeded: bool,
}

enum RoundOutcome {
    Finished,
    RateLimited,
    ToolCalls(Vec<ToolInvocation>),
}

/// Per-session conversation state machine.
///
/// Holds the history, streams model output, executes tool calls through the
/// backend and resubmits until the model answers without calling a tool.
/// `send_message` takes `&mut self`, so one engine never runs two turns at once.
pub struct ConversationEngine {
    provider: Arc<dyn ToolAwareLlmProvider>,
    backend: Arc<dyn ToolBackend>,
    catalog: Option<Arc<ToolCatalog>>,
    preamble: Arc<dyn MessagePreamble>,
    config: EngineConfig,
    history: ConversationHistory,
    started: bool,
    first_message_sent: bool,
    invocation_seq: u64,
}

impl ConversationEngine {
    pub fn new(provider: Arc<dyn ToolAwareLlmProvider>, backend: Arc<dyn ToolBackend>) -> Self {
        Self {
            provider,
            backend,
            catalog: None,
            preamble: Arc::new(NoPreamble),
            config: EngineConfig::default(),
            history: ConversationHistory::new(),
            started: false,
            first_message_sent: false,
            invocation_seq: 0,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an already fetched catalog instead of fetching one in `start`.
    pub fn with_catalog(mut self, catalog: Arc<ToolCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_preamble(mut self, preamble: Arc<dyn MessagePreamble>) -> Self {
        self.preamble = preamble;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.config.max_depth = max_depth;
        self
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn catalog(&self) -> Option<&Arc<ToolCatalog>> {
        self.catalog.as_ref()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn depth_bound(&self) -> usize {
        self.config.max_depth
    }

    /// Connect the backend and load the catalog. Calling it again is a no-op.
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        if self.started {
            return Ok(());
        }
        self.backend.connect().await?;
        if self.catalog.is_none() {
            let catalog =
                ToolCatalog::fetch(self.backend.as_ref(), self.config.catalog_timeout).await?;
            self.catalog = Some(Arc::new(catalog));
        }
        self.started = true;
        info!(
            provider = self.provider.provider_name(),
            tools = self.catalog.as_ref().map(|c| c.len()).unwrap_or(0),
            "Conversation engine started"
        );
        Ok(())
    }

    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.backend.disconnect().await;
        self.started = false;
        debug!("Conversation engine stopped");
    }

    /// Run one user turn, sending notifications to `notifications` as they happen.
    ///
    /// Rate limits, tool failures and unparseable arguments are handled inside
    /// the turn. Errors returned here mean the model stream broke or the tool
    /// provider is gone.
    pub async fn send_message(
        &mut self,
        text: impl Into<String>,
        notifications: &mpsc::Sender<Notification>,
    ) -> Result<TurnSummary, BridgeError> {
        if !self.started {
            return Err(BridgeError::NotStarted);
        }
        let catalog = self.catalog.clone().unwrap_or_default();

        let mut text = text.into();
        if !self.first_message_sent {
            text = self.preamble.apply(&text);
            self.first_message_sent = true;
        }
        self.history.push_user(text);

        let mut summary = TurnSummary::default();
        let mut depth = 0usize;

        loop {
            debug!(depth, "Starting model round");
            let outcome = self
                .run_model_round(&catalog, notifications, &mut summary)
                .await?;

            let calls = match outcome {
                RoundOutcome::Finished => break,
                RoundOutcome::RateLimited => {
                    summary.rate_limited = true;
                    break;
                }
                RoundOutcome::ToolCalls(calls) => calls,
            };

            info!(count = calls.len(), depth, "Executing tool calls");
            for invocation in calls {
                self.execute_invocation(invocation, &catalog, notifications, &mut summary)
                    .await?;
            }

            if depth + 1 > self.config.max_depth {
                warn!(
                    max_depth = self.config.max_depth,
                    "Tool recursion limit reached, ending turn"
                );
                let message = self.config.messages.too_complex.clone();
                self.history.push_assistant(message.clone());
                emit(notifications, Notification::TooComplex { message }).await;
                summary.depth_exceeded = true;
                break;
            }
            depth += 1;
            summary.depth = depth;
        }

        Ok(summary)
    }

    async fn run_model_round(
        &mut self,
        catalog: &ToolCatalog,
        notifications: &mpsc::Sender<Notification>,
        summary: &mut TurnSummary,
    ) -> Result<RoundOutcome, BridgeError> {
        summary.model_calls += 1;
        let opened = self
            .provider
            .stream_with_tools(
                self.history.provider_view(),
                self.config.system_prompt.clone(),
                catalog.definitions(),
                self.config.temperature,
                self.config.max_tokens,
            )
            .await;

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) if e.is_rate_limited() => {
                warn!(error = %e, "Model provider rate limited the request");
                self.notify_rate_limited(notifications).await;
                return Ok(RoundOutcome::RateLimited);
            }
            Err(e) => {
                error!(error = %e, "Failed to open model stream");
                self.notify_error(notifications).await;
                return Err(e.into());
            }
        };

        let mut text_buffer = String::new();
        let mut pending: Option<ToolInvocation> = None;
        let mut completed: Vec<ToolInvocation> = Vec::new();

        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) if e.is_rate_limited() => {
                    drop(stream);
                    warn!(error = %e, "Rate limited mid-stream, aborting model stream");
                    self.notify_rate_limited(notifications).await;
                    return Ok(RoundOutcome::RateLimited);
                }
                Err(e) => {
                    drop(stream);
                    error!(error = %e, "Model stream failed, aborting");
                    self.notify_error(notifications).await;
                    return Err(BridgeError::StreamProtocol(e.to_string()));
                }
            };

            match event {
                StreamEvent::TextDelta { text } => {
                    if text.is_empty() {
                        continue;
                    }
                    text_buffer.push_str(&text);
                    emit(notifications, Notification::AssistantDelta { text }).await;
                }
                StreamEvent::ToolCallStart { id, name } => {
                    if let Some(unfinished) = pending.take() {
                        warn!(
                            tool = %unfinished.tool_name,
                            "Tool call started before the previous one ended"
                        );
                        completed.push(unfinished);
                    }
                    self.invocation_seq += 1;
                    let invocation_id = format!("{}#{}", id, self.invocation_seq);
                    debug!(tool = %name, invocation = %invocation_id, "Tool call started");
                    pending = Some(ToolInvocation::new(invocation_id, name));
                }
                StreamEvent::ToolCallDelta {
                    arguments_delta, ..
                } => match pending.as_mut() {
                    Some(invocation) => invocation.push_fragment(&arguments_delta),
                    None => debug!("Argument fragment outside of a tool call, ignoring"),
                },
                StreamEvent::ToolCallEnd { .. } => {
                    if let Some(invocation) = pending.take() {
                        completed.push(invocation);
                    }
                }
                StreamEvent::MessageEnd { stop_reason } => {
                    debug!(?stop_reason, "Model message complete");
                    break;
                }
                StreamEvent::Error { message } => {
                    drop(stream);
                    error!(message = %message, "Model stream reported an error");
                    self.notify_error(notifications).await;
                    return Err(BridgeError::StreamProtocol(message));
                }
            }
        }

        if let Some(abandoned) = pending {
            warn!(
                tool = %abandoned.tool_name,
                "Stream ended inside a tool call, dropping it"
            );
        }

        if !text_buffer.is_empty() {
            self.history.push_assistant(text_buffer);
        }

        if completed.is_empty() {
            Ok(RoundOutcome::Finished)
        } else {
            Ok(RoundOutcome::ToolCalls(completed))
        }
    }

    async fn execute_invocation(
        &mut self,
        invocation: ToolInvocation,
        catalog: &ToolCatalog,
        notifications: &mpsc::Sender<Notification>,
        summary: &mut TurnSummary,
    ) -> Result<(), BridgeError> {
        let tool = invocation.tool_name.clone();
        let messages = &self.config.messages;

        let (arguments, fell_back) = match invocation.parse_arguments() {
            Ok(value) => (value, false),
            Err(e) => {
                let parse_error = BridgeError::ArgumentParse {
                    tool: tool.clone(),
                    message: e.to_string(),
                };
                match self.config.argument_policy {
                    ArgumentPolicy::Lenient => {
                        warn!(
                            error = %parse_error,
                            raw = %invocation.raw_arguments(),
                            "Falling back to empty arguments"
                        );
                        (Value::Object(Default::default()), true)
                    }
                    ArgumentPolicy::Strict => {
                        warn!(error = %parse_error, "Rejecting tool call with malformed arguments");
                        let text = messages.invalid_arguments(&tool, "not valid JSON");
                        self.history.push_user(text);
                        return Ok(());
                    }
                }
            }
        };

        if !self
            .history
            .push_tool(&invocation.id, &tool, arguments.clone())
        {
            warn!(invocation = %invocation.id, "Tool invocation already recorded, skipping");
            return Ok(());
        }
        emit(
            notifications,
            Notification::ToolInvoked {
                invocation_id: invocation.id.clone(),
                tool_name: tool.clone(),
                tool_args: arguments.clone(),
            },
        )
        .await;

        let rejection = if !catalog.contains(&tool) {
            Some(format!("unknown tool '{}'", tool))
        } else if fell_back {
            None
        } else {
            catalog.validate(&tool, &arguments).err()
        };
        if let Some(reason) = rejection {
            warn!(tool = %tool, reason = %reason, "Tool call failed validation");
            let text = self.config.messages.invalid_arguments(&tool, &reason);
            self.history.push_user(text);
            self.notify_finished(notifications, &invocation.id, &tool, true)
                .await;
            return Ok(());
        }

        summary.tool_calls += 1;
        let timeout = self.config.tool_timeout;
        let call = self
            .backend
            .call_tool(&invocation.id, &tool, arguments, timeout);

        let is_error = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) if !result.is_error => {
                info!(tool = %tool, bytes = result.content.len(), "Tool call succeeded");
                self.history
                    .push_user(format!("[Tool Result: {}]\n{}", tool, result.content));
                false
            }
            Ok(Ok(result)) => {
                warn!(tool = %tool, error = %result.content, "Tool reported an error");
                self.history
                    .push_user(self.config.messages.tool_failed(&tool));
                true
            }
            Ok(Err(e)) if e.is_connection_loss() => {
                error!(tool = %tool, error = %e, "Tool provider lost during call");
                self.notify_finished(notifications, &invocation.id, &tool, true)
                    .await;
                self.notify_error(notifications).await;
                return Err(e);
            }
            Ok(Err(e)) => {
                warn!(tool = %tool, error = %e, "Tool call failed");
                self.history
                    .push_user(self.config.messages.tool_failed(&tool));
                true
            }
            Err(_) => {
                let e = BridgeError::Timeout(timeout);
                warn!(tool = %tool, error = %e, "Tool call timed out");
                self.history
                    .push_user(self.config.messages.tool_failed(&tool));
                true
            }
        };

        self.notify_finished(notifications, &invocation.id, &tool, is_error)
            .await;
        Ok(())
    }

    async fn notify_rate_limited(&self, notifications: &mpsc::Sender<Notification>) {
        let message = self.config.messages.rate_limited.clone();
        emit(notifications, Notification::RateLimited { message }).await;
    }

    async fn notify_error(&self, notifications: &mpsc::Sender<Notification>) {
        let message = self.config.messages.generic_error.clone();
        emit(notifications, Notification::Error { message }).await;
    }

    async fn notify_finished(
        &self,
        notifications: &mpsc::Sender<Notification>,
        invocation_id: &str,
        tool: &str,
        is_error: bool,
    ) {
        emit(
            notifications,
            Notification::ToolFinished {
                invocation_id: invocation_id.to_string(),
                tool_name: tool.to_string(),
                is_error,
            },
        )
        .await;
    }
}

async fn emit(notifications: &mpsc::Sender<Notification>, notification: Notification) {
    if notifications.send(notification).await.is_err() {
        debug!("Notification receiver dropped");
    }
}
