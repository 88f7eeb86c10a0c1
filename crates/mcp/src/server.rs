//! Tool host: serves a [`ToolRegistry`] to one MCP client.
//!
//! The host reads requests from a [`FrameReader`] and writes responses to a
//! [`FrameWriter`]. Notifications it originates itself (such as
//! `notifications/tools/list_changed`) are queued through a [`HostNotifier`]
//! and interleaved with the responses.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use toolbridge_runtime::tool::ToolContext;
use toolbridge_runtime::ToolRegistry;

use crate::error::McpError;
use crate::transport::{FrameReader, FrameWriter};
use crate::types::*;

pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

/// Queues server-initiated notifications for an [`McpServer`]'s client.
#[derive(Debug, Clone)]
pub struct HostNotifier {
    tx: mpsc::Sender<String>,
}

impl HostNotifier {
    /// Fails with [`McpError::Terminated`] once the host has shut down.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let frame = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.tx.send(frame).await.map_err(|_| McpError::Terminated)
    }

    pub async fn tools_changed(&self) -> Result<(), McpError> {
        self.notify(TOOLS_LIST_CHANGED, None).await
    }
}

/// Serves the tools of a registry over MCP.
pub struct McpServer {
    registry: ToolRegistry,
    name: String,
    context: ToolContext,
    outbox: Option<mpsc::Receiver<String>>,
}

impl McpServer {
    pub fn new(registry: ToolRegistry) -> Self {
        let working_directory =
            std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from("/"));
        Self {
            registry,
            name: "toolbridge-mcp".to_string(),
            context: ToolContext { working_directory },
            outbox: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Handle for pushing notifications to the client. Every call replaces
    /// the previous outbox, so take it before [`serve`](Self::serve).
    pub fn notifier(&mut self) -> HostNotifier {
        let (tx, rx) = mpsc::channel(32);
        self.outbox = Some(rx);
        HostNotifier { tx }
    }

    /// Answer frames until the reader closes.
    pub async fn serve<R, W>(&mut self, reader: R, mut writer: W) -> Result<(), McpError>
    where
        R: FrameReader,
        W: FrameWriter,
    {
        info!(server = %self.name, tools = self.registry.len(), "Tool host serving");

        // The read future lives inside the stream, so losing a select race to
        // the outbox never drops a half-read line.
        let frames = stream::unfold(reader, |mut reader| async move {
            match reader.receive().await {
                Ok(Some(line)) => Some((Ok(line), reader)),
                Ok(None) => None,
                Err(e) => Some((Err(e), reader)),
            }
        });
        futures::pin_mut!(frames);
        let mut outbox = self.outbox.take();

        loop {
            tokio::select! {
                frame = frames.next() => {
                    let Some(frame) = frame else { break };
                    if let Some(reply) = self.dispatch(&frame?).await {
                        writer.send(&reply).await?;
                    }
                }
                Some(notification) = next_queued(&mut outbox) => {
                    debug!(frame = %notification, "Pushing notification");
                    writer.send(&notification).await?;
                }
            }
        }

        info!(server = %self.name, "Client closed the transport");
        Ok(())
    }

    /// Handle one raw frame and return the reply to send, if any.
    async fn dispatch(&mut self, line: &str) -> Option<String> {
        match IncomingFrame::parse(line) {
            Ok(IncomingFrame::Request(request)) => {
                let response = self.handle_request(&request).await;
                serde_json::to_string(&response).ok()
            }
            Ok(IncomingFrame::Notification(notif)) => {
                debug!(method = %notif.method, "Client notification");
                None
            }
            Ok(IncomingFrame::Response(resp)) => {
                debug!(id = %resp.id, "Ignoring response from client");
                None
            }
            Err(e) => {
                warn!(error = %e, "Unparseable frame from client");
                let frame = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": McpError::JsonParse(e).to_rpc_error(),
                });
                Some(frame.to_string())
            }
        }
    }

    pub async fn handle_request(&mut self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        let outcome = match request.method.as_str() {
            "initialize" => to_result(self.initialize_result()),
            "tools/list" => to_result(ListToolsResult {
                tools: self.registry.list().into_iter().map(ToolInfo::from).collect(),
                next_cursor: None,
            }),
            "tools/call" => match self.call_tool(&request.params).await {
                Ok(result) => to_result(result),
                Err(e) => Err(e),
            },
            "ping" => Ok(serde_json::json!({})),
            method => Err(McpError::MethodNotFound(method.to_string())),
        };

        match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => {
                debug!(method = %request.method, error = %e, "Request rejected");
                JsonRpcResponse::error(id, e.to_rpc_error().code, e.to_string())
            }
        }
    }

    fn initialize_result(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: self.outbox.is_some(),
                }),
            },
            server_info: ServerInfo {
                name: self.name.clone(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
        }
    }

    /// Tool failures are results with `is_error`, not protocol errors.
    async fn call_tool(&self, params: &Option<Value>) -> Result<CallToolResult, McpError> {
        let params = params
            .clone()
            .ok_or_else(|| McpError::InvalidParams("missing params".to_string()))?;
        let call: CallToolParams =
            serde_json::from_value(params).map_err(|e| McpError::InvalidParams(e.to_string()))?;
        let tool = self
            .registry
            .get(&call.name)
            .ok_or_else(|| McpError::ToolNotFound(call.name.clone()))?;

        debug!(tool = %call.name, "Calling hosted tool");
        let (text, is_error) = match tool.execute(call.arguments, &self.context).await {
            Ok(result) => (result.content, result.is_error),
            Err(e) => (e.to_string(), true),
        };
        Ok(CallToolResult {
            content: vec![ToolContent::Text { text }],
            is_error,
        })
    }
}

fn to_result(value: impl Serialize) -> Result<Value, McpError> {
    Ok(serde_json::to_value(value)?)
}

async fn next_queued(outbox: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match outbox {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use toolbridge_runtime::tool::EchoTool;

    fn test_registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool).unwrap();
        reg
    }

    fn spawn_host(
        mut server: McpServer,
    ) -> (ChannelTransport, tokio::task::JoinHandle<Result<(), McpError>>) {
        let (client_side, server_side) = ChannelTransport::pair();
        let handle = tokio::spawn(async move {
            let (reader, writer) = server_side.split();
            server.serve(reader, writer).await
        });
        (client_side, handle)
    }

    #[tokio::test]
    async fn test_handle_initialize() {
        let mut server = McpServer::new(test_registry());
        let req = JsonRpcRequest::new(
            RpcId::Number(1),
            "initialize",
            Some(serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "test-client"}
            })),
        );

        let resp = server.handle_request(&req).await;
        assert!(resp.error.is_none());
        let result: InitializeResult =
            serde_json::from_value(resp.result.unwrap()).unwrap();
        assert_eq!(result.protocol_version, PROTOCOL_VERSION);
        assert_eq!(result.server_info.name, "toolbridge-mcp");
        assert!(!result.capabilities.tools.unwrap().list_changed);
    }

    #[tokio::test]
    async fn test_list_changed_capability_follows_notifier() {
        let mut server = McpServer::new(test_registry());
        let _notifier = server.notifier();
        let resp = server
            .handle_request(&JsonRpcRequest::new(RpcId::Number(1), "initialize", None))
            .await;
        let result: InitializeResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert!(result.capabilities.tools.unwrap().list_changed);
    }

    #[tokio::test]
    async fn test_handle_list_tools() {
        let mut server = McpServer::new(test_registry());
        let req = JsonRpcRequest::new(RpcId::Number(2), "tools/list", None);

        let resp = server.handle_request(&req).await;
        assert!(resp.error.is_none());
        let result: ListToolsResult =
            serde_json::from_value(resp.result.unwrap()).unwrap();
        assert_eq!(result.tools.len(), 1);
        assert_eq!(result.tools[0].name, "echo");
        assert!(result.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_handle_call_tool() {
        let mut server = McpServer::new(test_registry());
        let req = JsonRpcRequest::new(
            RpcId::Number(3),
            "tools/call",
            Some(serde_json::json!({
                "name": "echo",
                "arguments": {"message": "hello mcp"}
            })),
        );

        let resp = server.handle_request(&req).await;
        assert!(resp.error.is_none());
        let result: CallToolResult =
            serde_json::from_value(resp.result.unwrap()).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.text(), "hello mcp");
    }

    #[tokio::test]
    async fn test_call_tool_rejections() {
        let mut server = McpServer::new(test_registry());

        let missing_tool = JsonRpcRequest::new(
            RpcId::Number(4),
            "tools/call",
            Some(serde_json::json!({"name": "nonexistent", "arguments": {}})),
        );
        let err = server.handle_request(&missing_tool).await.error.unwrap();
        assert_eq!(err.code, error_codes::INVALID_PARAMS);

        let missing_params = JsonRpcRequest::new(RpcId::Number(5), "tools/call", None);
        let err = server.handle_request(&missing_params).await.error.unwrap();
        assert_eq!(err.code, error_codes::INVALID_PARAMS);

        let unknown = JsonRpcRequest::new(RpcId::Number(6), "unknown/method", None);
        let err = server.handle_request(&unknown).await.error.unwrap();
        assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_builtin_tools_and_ping() {
        let mut server = McpServer::new(ToolRegistry::with_builtin_tools());

        let resp = server
            .handle_request(&JsonRpcRequest::new(RpcId::Number(1), "ping", None))
            .await;
        assert_eq!(resp.result, Some(serde_json::json!({})));

        let resp = server
            .handle_request(&JsonRpcRequest::new(
                RpcId::String("s".into()),
                "tools/call",
                Some(serde_json::json!({"name": "sum", "arguments": {"values": [1, 2]}})),
            ))
            .await;
        let result: CallToolResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert_eq!(result.text(), "3");
    }

    #[tokio::test]
    async fn test_serve_over_channel_transport() {
        let (mut client_side, host) = spawn_host(McpServer::new(test_registry()));

        let call_req = JsonRpcRequest::new(
            RpcId::Number(2),
            "tools/call",
            Some(serde_json::json!({
                "name": "echo",
                "arguments": {"message": "via transport"}
            })),
        );
        client_side
            .send(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await
            .unwrap();
        client_side
            .send(&serde_json::to_string(&call_req).unwrap())
            .await
            .unwrap();

        let resp_line = client_side.receive().await.unwrap().unwrap();
        let resp: JsonRpcResponse = serde_json::from_str(&resp_line).unwrap();
        assert_eq!(resp.id, RpcId::Number(2));
        let result: CallToolResult =
            serde_json::from_value(resp.result.unwrap()).unwrap();
        assert_eq!(result.text(), "via transport");

        drop(client_side);
        host.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_null_id_error() {
        let (mut client_side, host) = spawn_host(McpServer::new(test_registry()));

        client_side.send("{oops").await.unwrap();
        let line = client_side.receive().await.unwrap().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert!(value["id"].is_null());
        assert_eq!(value["error"]["code"], error_codes::PARSE_ERROR);

        drop(client_side);
        host.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_notifier_pushes_between_responses() {
        let mut server = McpServer::new(test_registry());
        let notifier = server.notifier();
        let (mut client_side, host) = spawn_host(server);

        notifier.tools_changed().await.unwrap();
        let line = client_side.receive().await.unwrap().unwrap();
        let pushed: JsonRpcNotification = serde_json::from_str(&line).unwrap();
        assert_eq!(pushed.method, TOOLS_LIST_CHANGED);

        client_side
            .send(r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#)
            .await
            .unwrap();
        let line = client_side.receive().await.unwrap().unwrap();
        let resp: JsonRpcResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(resp.id, RpcId::Number(7));

        drop(client_side);
        host.await.unwrap().unwrap();
        assert!(matches!(
            notifier.tools_changed().await,
            Err(McpError::Terminated)
        ));
    }
}
