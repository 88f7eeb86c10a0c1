//! The tool provider child process and its control channel.
//!
//! Requests are correlated by id: each outgoing request registers a oneshot
//! sender in a pending map, and a dedicated reader task completes it when the
//! matching response arrives. Any number of requests may be in flight.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::McpError;
use crate::transport::{FrameReader, FrameWriter, LineReader, LineWriter};
use crate::types::{
    error_codes, CallToolParams, CallToolResult, ClientCapabilities, ClientInfo, IncomingFrame,
    InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, RpcId, ToolInfo, PROTOCOL_VERSION,
};

/// Both halves of a freshly started provider, plus the OS child if there is one.
pub struct LaunchedProcess {
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
    pub child: Option<Child>,
}

/// Starts a tool provider and hands back its stdio.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self) -> Result<LaunchedProcess, McpError>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Launches the provider as an OS child process with piped stdio.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self) -> Result<LaunchedProcess, McpError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| McpError::LaunchFailed(format!("{}: {}", self.program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::LaunchFailed("failed to capture provider stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::LaunchFailed("failed to capture provider stdout".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let program = self.program.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(provider = %program, "stderr: {}", line);
                }
            });
        }

        info!(program = %self.program, pid = ?child.id(), "Tool provider spawned");

        Ok(LaunchedProcess {
            reader: Box::new(LineReader::new(stdout)),
            writer: Box::new(LineWriter::new(stdin)),
            child: Some(child),
        })
    }

    fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

struct Inner {
    writer: AsyncMutex<Box<dyn FrameWriter>>,
    pending: AsyncMutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>,
    next_id: AtomicU64,
    unsolicited: broadcast::Sender<String>,
    closed: watch::Sender<bool>,
    child: AsyncMutex<Option<Child>>,
}

/// A running tool provider with an id-correlated control channel.
pub struct ToolProviderProcess {
    inner: Arc<Inner>,
    reader_task: JoinHandle<()>,
}

impl ToolProviderProcess {
    /// Launch a provider and start reading its output.
    pub async fn launch(launcher: &dyn ProcessLauncher) -> Result<Self, McpError> {
        let launched = launcher.launch().await?;
        Ok(Self::from_parts(launched))
    }

    /// Wrap already-open halves. The reader task starts immediately.
    pub fn from_parts(launched: LaunchedProcess) -> Self {
        let (unsolicited, _) = broadcast::channel(64);
        let (closed, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            writer: AsyncMutex::new(launched.writer),
            pending: AsyncMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            unsolicited,
            closed,
            child: AsyncMutex::new(launched.child),
        });

        let reader_inner = Arc::clone(&inner);
        let reader = launched.reader;
        let reader_task = tokio::spawn(async move {
            reader_inner.reader_loop(reader).await;
        });

        Self { inner, reader_task }
    }

    /// Perform the MCP `initialize` handshake followed by `notifications/initialized`.
    pub async fn initialize(
        &self,
        client_name: &str,
        timeout: Duration,
    ) -> Result<InitializeResult, McpError> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: client_name.to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
        };
        let result = self
            .request("initialize", Some(serde_json::to_value(params)?), timeout)
            .await?;
        let init: InitializeResult = serde_json::from_value(result)?;
        self.notify("notifications/initialized", None).await?;

        info!(
            server = %init.server_info.name,
            protocol = %init.protocol_version,
            "Tool provider initialized"
        );
        Ok(init)
    }

    /// Send a request and wait for its result.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.inner.next_request_id("req");
        let request = JsonRpcRequest::new(RpcId::String(id.clone()), method, params);
        let response = self
            .inner
            .round_trip(id, &serde_json::to_string(&request)?, method, timeout)
            .await?;

        if let Some(err) = response.error {
            return Err(McpError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Send a notification. No response is expected.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params);
        self.inner
            .write_frame(&serde_json::to_string(&notification)?)
            .await
    }

    /// Forward a client's raw frame.
    ///
    /// Requests get a process-unique id on the wire; the response comes back
    /// with the client's original id. Frames without an id are written as-is
    /// and yield `None`.
    pub async fn forward(
        &self,
        mut frame: Value,
        timeout: Duration,
    ) -> Result<Option<JsonRpcResponse>, McpError> {
        let Some(object) = frame.as_object() else {
            return Err(McpError::InvalidParams("frame must be a JSON object".into()));
        };
        let method = object
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let client_id = match object.get("id") {
            Some(id) if !id.is_null() => Some(serde_json::from_value::<RpcId>(id.clone())?),
            _ => None,
        };

        let Some(client_id) = client_id else {
            self.inner.write_frame(&frame.to_string()).await?;
            return Ok(None);
        };

        let wire_id = self.inner.next_request_id("relay");
        frame["id"] = Value::String(wire_id.clone());

        let mut response = self
            .inner
            .round_trip(wire_id, &frame.to_string(), &method, timeout)
            .await?;
        response.id = client_id;
        Ok(Some(response))
    }

    /// Fetch every tool the provider exposes, following pagination cursors.
    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolInfo>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.request("tools/list", params, timeout).await?;
            let page: ListToolsResult = serde_json::from_value(result)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        debug!(count = tools.len(), "Listed provider tools");
        Ok(tools)
    }

    /// Invoke one tool.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<CallToolResult, McpError> {
        let arguments = match arguments {
            Value::Null => json!({}),
            other => other,
        };
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let result = self
            .request("tools/call", Some(serde_json::to_value(params)?), timeout)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Frames the provider sent without being asked (notifications).
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.inner.unsolicited.subscribe()
    }

    pub fn is_alive(&self) -> bool {
        !*self.inner.closed.borrow()
    }

    /// Resolves once the control channel has closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Kill the child and fail everything still pending.
    pub async fn shutdown(&self) {
        self.reader_task.abort();
        if let Some(mut child) = self.inner.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "Tool provider already exited");
            }
        }
        self.inner.mark_closed().await;
    }
}

impl Drop for ToolProviderProcess {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

impl Inner {
    fn next_request_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn write_frame(&self, frame: &str) -> Result<(), McpError> {
        if *self.closed.borrow() {
            return Err(McpError::Terminated);
        }
        self.writer.lock().await.send(frame).await
    }

    async fn round_trip(
        &self,
        id: String,
        frame: &str,
        method: &str,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if let Err(e) = self.write_frame(frame).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::Terminated),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                warn!(method, id = %id, ?timeout, "Tool provider request timed out");
                Err(McpError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            }
        }
    }

    async fn reader_loop(self: Arc<Self>, mut reader: Box<dyn FrameReader>) {
        loop {
            match reader.receive().await {
                Ok(Some(line)) => self.dispatch(&line).await,
                Ok(None) => {
                    debug!("Tool provider closed its output");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read from tool provider");
                    break;
                }
            }
        }

        if let Some(child) = self.child.lock().await.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                debug!(%status, "Tool provider exited");
            }
        }
        self.mark_closed().await;
    }

    async fn dispatch(&self, line: &str) {
        let frame = match IncomingFrame::parse(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, line, "Ignoring malformed frame from tool provider");
                return;
            }
        };

        match frame {
            IncomingFrame::Response(response) => {
                let key = response.id.to_string();
                let sender = self.pending.lock().await.remove(&key);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(id = %key, "Response for unknown request"),
                }
            }
            IncomingFrame::Request(request) => self.answer_provider_request(request).await,
            IncomingFrame::Notification(notification) => {
                debug!(method = %notification.method, "Notification from tool provider");
                let _ = self.unsolicited.send(line.to_string());
            }
        }
    }

    async fn answer_provider_request(&self, request: JsonRpcRequest) {
        let response = if request.method == "ping" {
            JsonRpcResponse::success(request.id, json!({}))
        } else {
            warn!(method = %request.method, "Tool provider sent unsupported request");
            JsonRpcResponse::error(
                request.id,
                error_codes::METHOD_NOT_FOUND,
                format!("client does not implement method '{}'", request.method),
            )
        };
        match serde_json::to_string(&response) {
            Ok(frame) => {
                if let Err(e) = self.write_frame(&frame).await {
                    warn!(error = %e, "Failed to answer tool provider request");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode response"),
        }
    }

    async fn mark_closed(&self) {
        self.closed.send_replace(true);
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            debug!(count = pending.len(), "Failing pending requests");
        }
        // Dropping the senders wakes each waiter with Terminated.
        pending.clear();
    }
}
