//! LLM provider implementations for the tool bridge.
//!
//! Providers translate conversation history into a vendor request and the
//! vendor's streaming response back into [`toolbridge_runtime::StreamEvent`]s.

pub mod providers;

pub use providers::claude_tool_provider::ClaudeToolProvider;
pub use providers::create_provider;
