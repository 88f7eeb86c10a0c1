use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who authored a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// Observer-only record of a tool invocation. Never sent to the model.
    Tool,
}

/// A message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<Value>,
    /// Invocation id for `tool` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_name: None,
            tool_args: None,
            invocation_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_name: None,
            tool_args: None,
            invocation_id: None,
        }
    }

    pub fn tool(invocation_id: impl Into<String>, tool_name: impl Into<String>, args: Value) -> Self {
        let tool_name = tool_name.into();
        Self {
            role: Role::Tool,
            content: format!("calling tool `{}`", tool_name),
            tool_name: Some(tool_name),
            tool_args: Some(args),
            invocation_id: Some(invocation_id.into()),
        }
    }
}

/// Ordered, append-only message log owned by a single conversation engine.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    messages: Vec<Message>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.messages.push(Message::user(text));
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.messages.push(Message::assistant(text));
    }

    /// Record a tool invocation. Returns `false` without appending when the
    /// invocation id has already been recorded.
    pub fn push_tool(&mut self, invocation_id: &str, tool_name: &str, args: Value) -> bool {
        if self.has_invocation(invocation_id) {
            return false;
        }
        self.messages
            .push(Message::tool(invocation_id, tool_name, args));
        true
    }

    pub fn has_invocation(&self, invocation_id: &str) -> bool {
        self.messages
            .iter()
            .any(|m| m.role == Role::Tool && m.invocation_id.as_deref() == Some(invocation_id))
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The user/assistant turns the model provider is allowed to see.
    pub fn provider_view(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.role != Role::Tool)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn count_role(&self, role: Role) -> usize {
        self.messages.iter().filter(|m| m.role == role).count()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Approximate token count using character count / 4 heuristic.
    pub fn approximate_tokens(&self) -> usize {
        let char_count: usize = self.messages.iter().map(|m| m.content.len()).sum();
        char_count / 4
    }
}
