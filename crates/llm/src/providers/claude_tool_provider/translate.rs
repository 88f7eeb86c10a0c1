//! Translation between the bridge's conversation types and the Claude API format.

use serde_json::{json, Value};

use toolbridge_runtime::{
    conversation::{Message, Role},
    tool::ToolDefinition,
};

/// Translate a [`ToolDefinition`] into the Claude API tool format.
pub(super) fn tool_definition_to_claude(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.input_schema,
    })
}

/// Translate history into Claude API message objects.
///
/// `tool` entries are observer notes and never sent. Empty turns are
/// skipped and consecutive turns of the same role are merged, since the
/// API expects non-empty, alternating user/assistant content.
pub(super) fn messages_to_claude(messages: &[Message]) -> Vec<Value> {
    let mut merged: Vec<(&'static str, String)> = Vec::new();

    for msg in messages {
        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => continue,
        };
        if msg.content.trim().is_empty() {
            continue;
        }
        match merged.last_mut() {
            Some((last_role, text)) if *last_role == role => {
                text.push_str("\n\n");
                text.push_str(&msg.content);
            }
            _ => merged.push((role, msg.content.clone())),
        }
    }

    merged
        .into_iter()
        .map(|(role, content)| json!({ "role": role, "content": content }))
        .collect()
}
