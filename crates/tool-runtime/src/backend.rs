//! The seam between the conversation engine and whatever executes tools.
//!
//! In production this is the connection supervisor from the MCP crate; tests
//! use [`mock::MockToolBackend`].

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::error::BridgeError;
use crate::tool::{ToolDefinition, ToolResult};

/// Something that can reach the tool provider.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Bring the tool provider to a usable state. Must be idempotent.
    async fn connect(&self) -> Result<(), BridgeError>;

    /// Introspect the provider's tools.
    async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolDefinition>, BridgeError>;

    /// Execute one tool call.
    ///
    /// A tool that ran and reported failure is returned as `Ok` with
    /// `is_error` set; `Err` is reserved for calls that never produced a
    /// result.
    async fn call_tool(
        &self,
        call_id: &str,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<ToolResult, BridgeError>;

    /// Release whatever `connect` acquired for this caller.
    async fn disconnect(&self) {}
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// What the mock answers for a tool.
    #[derive(Debug, Clone)]
    pub enum MockOutcome {
        Text(String),
        ToolError(String),
        Unreachable,
        Lost,
    }

    /// A recorded tool call.
    #[derive(Debug, Clone)]
    pub struct RecordedCall {
        pub call_id: String,
        pub name: String,
        pub arguments: Value,
    }

    /// In-memory backend with scripted outcomes per tool name.
    ///
    /// Outcomes queued with [`MockToolBackend::script`] are consumed first; once
    /// a tool's queue is empty the default outcome applies.
    pub struct MockToolBackend {
        tools: Vec<ToolDefinition>,
        scripts: Mutex<HashMap<String, VecDeque<MockOutcome>>>,
        default_outcome: MockOutcome,
        calls: Mutex<Vec<RecordedCall>>,
        connects: AtomicUsize,
        refuse_connect: bool,
        catalog_delay: Option<Duration>,
    }

    impl MockToolBackend {
        pub fn new(tools: Vec<ToolDefinition>) -> Self {
            Self {
                tools,
                scripts: Mutex::new(HashMap::new()),
                default_outcome: MockOutcome::Text("ok".to_string()),
                calls: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                refuse_connect: false,
                catalog_delay: None,
            }
        }

        /// Backend exposing a single tool with an open object schema.
        pub fn with_tool(name: &str) -> Self {
            Self::new(vec![ToolDefinition {
                name: name.to_string(),
                description: format!("{} tool", name),
                input_schema: serde_json::json!({"type": "object"}),
            }])
        }

        pub fn refusing_connections(mut self) -> Self {
            self.refuse_connect = true;
            self
        }

        pub fn with_catalog_delay(mut self, delay: Duration) -> Self {
            self.catalog_delay = Some(delay);
            self
        }

        pub fn with_default_outcome(mut self, outcome: MockOutcome) -> Self {
            self.default_outcome = outcome;
            self
        }

        pub fn script(&self, tool: &str, outcome: MockOutcome) {
            self.scripts
                .lock()
                .unwrap()
                .entry(tool.to_string())
                .or_default()
                .push_back(outcome);
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ToolBackend for MockToolBackend {
        async fn connect(&self) -> Result<(), BridgeError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse_connect {
                return Err(BridgeError::ConnectFailed {
                    attempts: 4,
                    reason: "mock refuses connections".to_string(),
                });
            }
            Ok(())
        }

        async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolDefinition>, BridgeError> {
            if let Some(delay) = self.catalog_delay {
                if delay >= timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(BridgeError::Timeout(timeout));
                }
                tokio::time::sleep(delay).await;
            }
            Ok(self.tools.clone())
        }

        async fn call_tool(
            &self,
            call_id: &str,
            name: &str,
            arguments: Value,
            _timeout: Duration,
        ) -> Result<ToolResult, BridgeError> {
            self.calls.lock().unwrap().push(RecordedCall {
                call_id: call_id.to_string(),
                name: name.to_string(),
                arguments,
            });
            let outcome = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(name)
                .and_then(|queue| queue.pop_front())
                .unwrap_or_else(|| self.default_outcome.clone());
            match outcome {
                MockOutcome::Text(text) => Ok(ToolResult::text(call_id, text)),
                MockOutcome::ToolError(text) => Ok(ToolResult::error(call_id, text)),
                MockOutcome::Unreachable => Err(BridgeError::ToolExecution {
                    tool: name.to_string(),
                    message: "broken pipe".to_string(),
                }),
                MockOutcome::Lost => Err(BridgeError::MaxReconnectExceeded { attempts: 3 }),
            }
        }
    }
}
