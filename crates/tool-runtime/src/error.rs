//! Error taxonomy shared by the conversation engine and its tool backends.

use std::time::Duration;

use crate::provider::LlmError;

/// Errors raised by the bridge.
///
/// Only a subset ever leaves [`ConversationEngine::send_message`]: rate limits,
/// tool failures and malformed arguments are absorbed inside the turn and turned
/// into notifications or corrective history entries. The remaining variants
/// mean the session can no longer continue and are for the caller to handle.
///
/// [`ConversationEngine::send_message`]: crate::engine::ConversationEngine::send_message
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The tool provider never answered the catalog request, or answered with
    /// something that is not a tool list.
    #[error("tool catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// The supervisor could not bring the tool provider to `Ready`.
    #[error("failed to connect to tool provider after {attempts} attempt(s): {reason}")]
    ConnectFailed { attempts: u32, reason: String },

    /// The supervisor gave up reconnecting. Terminal for that supervisor.
    #[error("tool provider lost: gave up after {attempts} reconnect attempt(s)")]
    MaxReconnectExceeded { attempts: u32 },

    /// The model provider refused the request because of rate limiting.
    #[error("rate limited by model provider")]
    RateLimited { retry_after_secs: Option<u64> },

    /// A tool call reached the provider but did not produce a usable result.
    #[error("tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// The model stream broke or produced an error event.
    #[error("model stream failed: {0}")]
    StreamProtocol(String),

    /// The argument payload of a tool call was not valid JSON.
    #[error("could not parse arguments for tool '{tool}': {message}")]
    ArgumentParse { tool: String, message: String },

    /// A call timed out waiting for the tool provider.
    #[error("tool provider did not answer within {0:?}")]
    Timeout(Duration),

    /// `send_message` was called before `start`.
    #[error("conversation engine has not been started")]
    NotStarted,

    /// Another `send_message` is still running on the same session.
    #[error("a message is already being processed for this session")]
    Busy,
}

impl BridgeError {
    /// Whether the error means the tool provider itself is gone, as opposed to a
    /// single call going wrong.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            BridgeError::ConnectFailed { .. } | BridgeError::MaxReconnectExceeded { .. }
        )
    }
}

impl From<LlmError> for BridgeError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::RateLimited { retry_after_secs } => BridgeError::RateLimited {
                retry_after_secs: Some(retry_after_secs),
            },
            other => BridgeError::StreamProtocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_maps_from_llm_error() {
        let err: BridgeError = LlmError::RateLimited { retry_after_secs: 7 }.into();
        match err {
            BridgeError::RateLimited { retry_after_secs } => {
                assert_eq!(retry_after_secs, Some(7))
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_other_llm_errors_become_stream_errors() {
        let err: BridgeError = LlmError::NetworkError("reset".to_string()).into();
        assert!(matches!(err, BridgeError::StreamProtocol(ref m) if m.contains("reset")));
    }

    #[test]
    fn test_connection_loss_classification() {
        assert!(BridgeError::MaxReconnectExceeded { attempts: 3 }.is_connection_loss());
        assert!(BridgeError::ConnectFailed {
            attempts: 4,
            reason: "spawn".into()
        }
        .is_connection_loss());
        assert!(!BridgeError::Busy.is_connection_loss());
        assert!(!BridgeError::ToolExecution {
            tool: "q".into(),
            message: "boom".into()
        }
        .is_connection_loss());
    }
}
