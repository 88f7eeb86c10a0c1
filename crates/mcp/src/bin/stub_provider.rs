//! Minimal MCP tool provider serving the built-in `echo` and `sum` tools over stdio.
//!
//! Logs go to stderr; stdout carries protocol frames only.

use toolbridge_mcp::{McpServer, StdioTransport};
use toolbridge_runtime::ToolRegistry;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut server =
        McpServer::new(ToolRegistry::with_builtin_tools()).with_name("toolbridge-stub-provider");
    let (reader, writer) = StdioTransport::new().split();
    server.serve(reader, writer).await?;
    Ok(())
}
