//! Error types for the MCP crate.

use std::time::Duration;

use crate::types::{error_codes, JsonRpcError};

/// Errors that can occur during MCP operations.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// Failed to parse JSON.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Transport I/O error.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The requested method is not supported.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Invalid parameters for a method.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// The requested tool was not found in the registry.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Tool execution failed.
    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    /// Protocol version mismatch.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// The tool provider process could not be started.
    #[error("Failed to launch tool provider: {0}")]
    LaunchFailed(String),

    /// The tool provider process exited or closed its output.
    #[error("Tool provider terminated")]
    Terminated,

    /// No response arrived within the deadline.
    #[error("Request '{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    /// The tool provider answered with a JSON-RPC error.
    #[error("Tool provider returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The tool provider is not connected.
    #[error("Server unavailable: {0}")]
    ServerUnavailable(String),
}

impl McpError {
    /// Convert to a JSON-RPC error object.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        let code = match self {
            McpError::JsonParse(_) => error_codes::PARSE_ERROR,
            McpError::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            McpError::InvalidParams(_) | McpError::ToolNotFound(_) => error_codes::INVALID_PARAMS,
            McpError::Rpc { code, .. } => *code,
            McpError::Timeout { .. } => error_codes::REQUEST_TIMEOUT,
            McpError::Terminated
            | McpError::LaunchFailed(_)
            | McpError::ServerUnavailable(_) => error_codes::PROVIDER_UNAVAILABLE,
            _ => error_codes::INTERNAL_ERROR,
        };
        JsonRpcError {
            code,
            message: self.to_string(),
            data: None,
        }
    }

    /// Whether the failure means the provider process is gone.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            McpError::Terminated
                | McpError::Transport(_)
                | McpError::LaunchFailed(_)
                | McpError::ServerUnavailable(_)
        )
    }
}
