//! MCP (Model Context Protocol) plumbing for the tool bridge.
//!
//! The bridge talks to exactly one tool provider process over JSON-RPC 2.0
//! on newline-delimited stdio and shares it between conversation engines and
//! relay clients.
//!
//! # Architecture
//!
//! - **types**: JSON-RPC 2.0 and MCP-specific protocol types
//! - **transport**: line-framed reader/writer halves (stdio, child pipes, channels)
//! - **process**: launcher seam and the id-correlated [`ToolProviderProcess`]
//! - **supervisor**: [`ConnectionSupervisor`] state machine, reconnects, relay
//! - **server**: MCP server wrapping a `ToolRegistry`, used by the stub provider
//! - **error**: Unified error types
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use toolbridge_mcp::{CommandLauncher, ConnectionSupervisor, SupervisorSettings};
//!
//! # async fn example() {
//! let launcher = Arc::new(CommandLauncher::new("toolbridge-stub-provider", vec![]));
//! let supervisor = ConnectionSupervisor::new(launcher, SupervisorSettings::default());
//! supervisor.start().await.unwrap();
//! println!("{:?}", supervisor.status());
//! # }
//! ```

pub mod error;
pub mod process;
pub mod server;
pub mod supervisor;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::McpError;
pub use process::{CommandLauncher, LaunchedProcess, ProcessLauncher, ToolProviderProcess};
pub use server::{HostNotifier, McpServer};
pub use supervisor::{
    ClientHandle, ConnectionState, ConnectionSupervisor, SupervisorSettings, SupervisorStatus,
};
pub use transport::{ChannelTransport, FrameReader, FrameWriter, StdioTransport};
pub use types::*;
