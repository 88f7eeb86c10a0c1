//! Tunable behaviour of the conversation engine.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use toolbridge_core::config::EngineSettings;

/// What to do when a tool call's argument payload is not valid JSON.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentPolicy {
    /// Run the tool with `{}` and log a warning.
    #[default]
    Lenient,
    /// Skip the call and ask the model to resend valid arguments.
    Strict,
}

impl FromStr for ArgumentPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lenient" => Ok(ArgumentPolicy::Lenient),
            "strict" => Ok(ArgumentPolicy::Strict),
            other => Err(format!("unknown argument policy '{}'", other)),
        }
    }
}

/// Hook that may rewrite the first user message of a session.
pub trait MessagePreamble: Send + Sync {
    fn apply(&self, text: &str) -> String;
}

/// Leaves the message untouched.
pub struct NoPreamble;

impl MessagePreamble for NoPreamble {
    fn apply(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Prepends a fixed instruction block.
pub struct StaticPreamble {
    instruction: String,
}

impl StaticPreamble {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
        }
    }
}

impl MessagePreamble for StaticPreamble {
    fn apply(&self, text: &str) -> String {
        format!("{}\n\n{}", self.instruction.trim_end(), text)
    }
}

/// The configured first-message preamble; unset or blank means none.
pub fn configured_preamble(settings: &EngineSettings) -> Arc<dyn MessagePreamble> {
    match settings.preamble.as_deref() {
        Some(text) if !text.trim().is_empty() => Arc::new(StaticPreamble::new(text)),
        _ => Arc::new(NoPreamble),
    }
}

/// User-visible texts the engine produces on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMessages {
    pub rate_limited: String,
    pub too_complex: String,
    pub generic_error: String,
    /// `{tool}` is replaced by the tool name.
    pub tool_failed: String,
    /// `{tool}` and `{reason}` are replaced.
    pub invalid_arguments: String,
}

impl Default for TurnMessages {
    fn default() -> Self {
        Self {
            rate_limited: "Rate limit exceeded, please wait a moment and try again.".to_string(),
            too_complex: "Request too complex, please narrow the question.".to_string(),
            generic_error: "An error occurred while generating the response.".to_string(),
            tool_failed: "The call to tool `{tool}` failed. Please correct the query and \
                          arguments, then retry with a valid call."
                .to_string(),
            invalid_arguments: "The arguments for tool `{tool}` were rejected ({reason}). \
                                Please correct them and retry the call."
                .to_string(),
        }
    }
}

impl TurnMessages {
    pub fn tool_failed(&self, tool: &str) -> String {
        self.tool_failed.replace("{tool}", tool)
    }

    pub fn invalid_arguments(&self, tool: &str, reason: &str) -> String {
        self.invalid_arguments
            .replace("{tool}", tool)
            .replace("{reason}", reason)
    }
}
