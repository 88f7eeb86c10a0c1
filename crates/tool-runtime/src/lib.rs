//! Conversation runtime for the tool bridge.
//!
//! Streams model output, assembles tool calls, executes them through a
//! [`ToolBackend`] and feeds results back until the model produces a final answer.

pub mod backend;
pub mod catalog;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod invocation;
pub mod notification;
pub mod policy;
pub mod provider;
pub mod registry;
pub mod stream;
pub mod tool;

pub use backend::ToolBackend;
pub use catalog::{ToolCatalog, DEFAULT_CATALOG_TIMEOUT};
pub use conversation::{ConversationHistory, Message, Role};
pub use engine::{ConversationEngine, EngineConfig, TurnSummary};
pub use error::BridgeError;
pub use invocation::ToolInvocation;
pub use notification::Notification;
pub use policy::{
    configured_preamble, ArgumentPolicy, MessagePreamble, NoPreamble, StaticPreamble, TurnMessages,
};
pub use provider::{EventStream, LlmError, ToolAwareLlmProvider};
pub use registry::ToolRegistry;
pub use stream::{StopReason, StreamEvent};
pub use tool::{Tool, ToolCall, ToolDefinition, ToolResult};
