use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Incremental output of a turn, delivered to observers in stream order.
///
/// Assistant deltas must be concatenated by the consumer, not replaced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    AssistantDelta {
        text: String,
    },
    ToolInvoked {
        invocation_id: String,
        tool_name: String,
        tool_args: Value,
    },
    ToolFinished {
        invocation_id: String,
        tool_name: String,
        is_error: bool,
    },
    RateLimited {
        message: String,
    },
    TooComplex {
        message: String,
    },
    Error {
        message: String,
    },
}

impl Notification {
    /// Text an assistant bubble should show for this notification, if any.
    pub fn assistant_text(&self) -> Option<&str> {
        match self {
            Notification::AssistantDelta { text } => Some(text),
            Notification::RateLimited { message }
            | Notification::TooComplex { message }
            | Notification::Error { message } => Some(message),
            Notification::ToolInvoked { .. } | Notification::ToolFinished { .. } => None,
        }
    }

    /// Event name used when the notification is sent as an SSE frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::AssistantDelta { .. } => "assistant_delta",
            Notification::ToolInvoked { .. } => "tool_invoked",
            Notification::ToolFinished { .. } => "tool_finished",
            Notification::RateLimited { .. } => "rate_limited",
            Notification::TooComplex { .. } => "too_complex",
            Notification::Error { .. } => "error",
        }
    }
}
