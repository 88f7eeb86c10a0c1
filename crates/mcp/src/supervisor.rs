//! Connection supervisor: keeps exactly one tool provider alive and shares it.
//!
//! State machine:
//!
//! ```text
//! Stopped → Starting → Ready → Disconnected → Reconnecting → Ready
//!                                                  └──────→ Stopped (retries exhausted)
//! ```
//!
//! The supervisor is used two ways: conversation engines reach it through the
//! [`ToolBackend`] seam, and relay clients push raw JSON-RPC frames through
//! [`ConnectionSupervisor::relay`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch, Notify, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use toolbridge_core::config::ToolProviderConfig;
use toolbridge_runtime::{BridgeError, ToolBackend, ToolDefinition, ToolResult};

use crate::error::McpError;
use crate::process::{CommandLauncher, ProcessLauncher, ToolProviderProcess};
use crate::types::{error_codes, JsonRpcError};

/// Lifecycle of the supervised provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Stopped,
    Starting,
    Ready,
    Disconnected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Stopped => "stopped",
            ConnectionState::Starting => "starting",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Tunables for a [`ConnectionSupervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Retries after the first spawn, and reconnect attempts after a loss.
    pub max_reconnect_attempts: u32,
    /// Fixed delay before each retry.
    pub backoff: Duration,
    /// Deadline for the handshake and for relayed requests.
    pub request_timeout: Duration,
    /// Name sent in `clientInfo` during the handshake.
    pub client_name: String,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 3,
            backoff: Duration::from_secs(1),
            request_timeout: Duration::from_secs(120),
            client_name: "toolbridge".to_string(),
        }
    }
}

impl SupervisorSettings {
    pub fn from_config(config: &ToolProviderConfig, client_name: &str) -> Self {
        Self {
            max_reconnect_attempts: config.max_reconnect_attempts,
            backoff: config.backoff(),
            request_timeout: config.request_timeout(),
            client_name: client_name.to_string(),
        }
    }
}

/// Snapshot returned by the status probe.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub running: bool,
    pub state: ConnectionState,
    pub clients: usize,
    pub reconnect_attempts: u32,
    pub exhausted: bool,
    pub provider: String,
}

/// A registered relay client. The supervisor only keeps a weak reference;
/// dropping the last `Arc` removes the client from fan-out.
#[derive(Debug)]
pub struct ClientHandle {
    id: Uuid,
    tx: mpsc::Sender<String>,
}

impl ClientHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

enum AttemptError {
    Cancelled,
    Exhausted { attempts: u32, reason: String },
}

/// Owns the single tool provider process.
pub struct ConnectionSupervisor {
    me: Weak<ConnectionSupervisor>,
    launcher: Arc<dyn ProcessLauncher>,
    settings: SupervisorSettings,
    process: RwLock<Option<Arc<ToolProviderProcess>>>,
    state: watch::Sender<ConnectionState>,
    connecting: AtomicBool,
    attempt_done: Notify,
    exhausted: AtomicBool,
    reconnect_attempts: AtomicU32,
    stop_epoch: AtomicU64,
    last_error: Mutex<Option<String>>,
    clients: Mutex<HashMap<Uuid, Weak<ClientHandle>>>,
}

impl ConnectionSupervisor {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, settings: SupervisorSettings) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Stopped);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            launcher,
            settings,
            process: RwLock::new(None),
            state,
            connecting: AtomicBool::new(false),
            attempt_done: Notify::new(),
            exhausted: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            stop_epoch: AtomicU64::new(0),
            last_error: Mutex::new(None),
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Supervise the configured tool provider command. Nothing is spawned
    /// until the first `start()`.
    pub fn from_config(config: &ToolProviderConfig, client_name: &str) -> Arc<Self> {
        info!(command = %config.command_line(), "Tool provider configured");
        let launcher: Arc<dyn ProcessLauncher> =
            Arc::new(CommandLauncher::new(config.command.clone(), config.args.clone()));
        Self::new(launcher, SupervisorSettings::from_config(config, client_name))
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn status(&self) -> SupervisorStatus {
        let state = self.state();
        SupervisorStatus {
            running: state == ConnectionState::Ready,
            state,
            clients: self.client_count(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::SeqCst),
            exhausted: self.exhausted.load(Ordering::SeqCst),
            provider: self.launcher.describe(),
        }
    }

    /// Bring the provider to `Ready`.
    ///
    /// Idempotent. Concurrent callers collapse onto the attempt already in
    /// flight and share its outcome.
    pub async fn start(&self) -> Result<(), BridgeError> {
        if self.exhausted.load(Ordering::SeqCst) {
            return Err(self.exhausted_error());
        }
        if self.live_process().await.is_some() {
            return Ok(());
        }

        if self
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Start already in progress, waiting for it");
            self.wait_for_attempt().await;
            return match self.live_process().await {
                Some(_) => Ok(()),
                None => Err(self.unavailable_error()),
            };
        }

        let epoch = self.stop_epoch.load(Ordering::SeqCst);
        self.set_state(ConnectionState::Starting);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        info!(provider = %self.launcher.describe(), "Starting tool provider");

        let result = match self.connect_with_retries(false, epoch).await {
            Ok(process) => {
                self.install(Arc::clone(&process)).await;
                if let Some(me) = self.me.upgrade() {
                    tokio::spawn(me.supervise(process));
                }
                Ok(())
            }
            Err(AttemptError::Cancelled) => Err(BridgeError::ConnectFailed {
                attempts: 0,
                reason: "supervisor stopped during start".to_string(),
            }),
            Err(AttemptError::Exhausted { attempts, reason }) => {
                warn!(attempts, reason = %reason, "Tool provider failed to start");
                self.set_state(ConnectionState::Stopped);
                Err(BridgeError::ConnectFailed { attempts, reason })
            }
        };

        self.finish_attempt();
        result
    }

    /// Kill the provider and return to `Stopped`.
    ///
    /// A supervisor whose reconnect attempts ran out stays exhausted.
    pub async fn stop(&self) {
        self.stop_epoch.fetch_add(1, Ordering::SeqCst);
        let process = self.process.write().await.take();
        if let Some(process) = process {
            info!("Stopping tool provider");
            process.shutdown().await;
        }
        self.set_state(ConnectionState::Stopped);
    }

    /// Register a relay client. Frames pushed to it arrive on the receiver.
    pub fn register_client(&self) -> (Arc<ClientHandle>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(64);
        let handle = Arc::new(ClientHandle {
            id: Uuid::new_v4(),
            tx,
        });
        let count = match self.clients.lock() {
            Ok(mut clients) => {
                clients.insert(handle.id, Arc::downgrade(&handle));
                clients.len()
            }
            Err(_) => 0,
        };
        info!(client = %handle.id, clients = count, "Relay client registered");
        (handle, rx)
    }

    pub fn deregister_client(&self, id: Uuid) {
        if let Ok(mut clients) = self.clients.lock() {
            if clients.remove(&id).is_some() {
                info!(client = %id, clients = clients.len(), "Relay client deregistered");
            }
        }
    }

    pub fn client_count(&self) -> usize {
        match self.clients.lock() {
            Ok(mut clients) => {
                clients.retain(|_, weak| weak.strong_count() > 0);
                clients.len()
            }
            Err(_) => 0,
        }
    }

    /// Forward a client's raw frame to the provider.
    ///
    /// Returns the frame to send back to that client, if any. Failures come
    /// back as JSON-RPC error frames; the provider is left running.
    pub async fn relay(&self, frame: &str, from: &ClientHandle) -> Option<String> {
        let value: Value = match serde_json::from_str(frame) {
            Ok(value) => value,
            Err(e) => {
                debug!(client = %from.id, error = %e, "Unparseable relay frame");
                return Some(error_frame(
                    Value::Null,
                    JsonRpcError {
                        code: error_codes::PARSE_ERROR,
                        message: format!("Parse error: {}", e),
                        data: None,
                    },
                ));
            }
        };
        let id = value.get("id").cloned().unwrap_or(Value::Null);

        let Some(process) = self.live_process().await else {
            return Some(error_frame(
                id,
                JsonRpcError {
                    code: error_codes::PROVIDER_UNAVAILABLE,
                    message: self.unavailable_error().to_string(),
                    data: None,
                },
            ));
        };

        match process.forward(value, self.settings.request_timeout).await {
            Ok(Some(response)) => match serde_json::to_string(&response) {
                Ok(out) => Some(out),
                Err(e) => Some(error_frame(id, McpError::from(e).to_rpc_error())),
            },
            Ok(None) => None,
            Err(e) => {
                warn!(client = %from.id, error = %e, "Relay request failed");
                Some(error_frame(id, e.to_rpc_error()))
            }
        }
    }

    async fn live_process(&self) -> Option<Arc<ToolProviderProcess>> {
        self.process
            .read()
            .await
            .as_ref()
            .filter(|p| p.is_alive())
            .cloned()
    }

    /// Launch and handshake, retrying with a fixed backoff.
    ///
    /// A start makes one attempt plus `max_reconnect_attempts` retries; a
    /// reconnect makes `max_reconnect_attempts` attempts, each after a backoff.
    async fn connect_with_retries(
        &self,
        reconnecting: bool,
        epoch: u64,
    ) -> Result<Arc<ToolProviderProcess>, AttemptError> {
        let retries = self.settings.max_reconnect_attempts;
        let total = if reconnecting { retries } else { retries + 1 };
        let mut reason = String::from("no attempt made");

        for attempt in 1..=total {
            if reconnecting || attempt > 1 {
                self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.settings.backoff).await;
            }
            if self.stop_epoch.load(Ordering::SeqCst) != epoch {
                return Err(AttemptError::Cancelled);
            }

            match self.launch_once().await {
                Ok(process) => {
                    if self.stop_epoch.load(Ordering::SeqCst) != epoch {
                        process.shutdown().await;
                        return Err(AttemptError::Cancelled);
                    }
                    return Ok(process);
                }
                Err(e) => {
                    warn!(attempt, of = total, error = %e, "Tool provider connect attempt failed");
                    reason = e.to_string();
                    self.record_error(&reason);
                }
            }
        }

        Err(AttemptError::Exhausted {
            attempts: total,
            reason,
        })
    }

    async fn launch_once(&self) -> Result<Arc<ToolProviderProcess>, McpError> {
        let process = ToolProviderProcess::launch(self.launcher.as_ref()).await?;
        if let Err(e) = process
            .initialize(&self.settings.client_name, self.settings.request_timeout)
            .await
        {
            process.shutdown().await;
            return Err(e);
        }
        Ok(Arc::new(process))
    }

    /// Publish a handshaken process and forward its unsolicited frames to
    /// every registered client.
    async fn install(&self, process: Arc<ToolProviderProcess>) {
        *self.process.write().await = Some(Arc::clone(&process));
        self.set_state(ConnectionState::Ready);
        info!("Tool provider ready");

        let Some(fanout) = self.me.upgrade() else {
            return;
        };
        let mut unsolicited = process.subscribe();
        tokio::spawn(async move {
            loop {
                match unsolicited.recv().await {
                    Ok(frame) => fanout.broadcast_to_clients(&frame),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Relay fan-out lagging, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Supervision loop for one start: wait for the provider to go away,
    /// reconnect, swap in the new process and wait again.
    ///
    /// Ends when the process is replaced by `stop`/`start`, when a stop
    /// cancels the reconnect, or when the reconnect attempts run out.
    async fn supervise(self: Arc<Self>, mut process: Arc<ToolProviderProcess>) {
        loop {
            process.closed().await;

            let still_current = matches!(
                self.process.read().await.as_ref(),
                Some(current) if Arc::ptr_eq(current, &process)
            );
            if !still_current {
                return;
            }

            if self
                .connecting
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                debug!("Reconnect skipped, a start is already in progress");
                return;
            }

            let epoch = self.stop_epoch.load(Ordering::SeqCst);
            *self.process.write().await = None;
            warn!("Tool provider disconnected");
            self.set_state(ConnectionState::Disconnected);
            self.reconnect_attempts.store(0, Ordering::SeqCst);
            self.set_state(ConnectionState::Reconnecting);

            match self.connect_with_retries(true, epoch).await {
                Ok(next) => {
                    info!(
                        attempts = self.reconnect_attempts.load(Ordering::SeqCst),
                        "Tool provider reconnected"
                    );
                    self.install(Arc::clone(&next)).await;
                    self.finish_attempt();
                    process = next;
                }
                Err(AttemptError::Cancelled) => {
                    debug!("Reconnect cancelled by stop");
                    self.finish_attempt();
                    return;
                }
                Err(AttemptError::Exhausted { attempts, reason }) => {
                    self.exhausted.store(true, Ordering::SeqCst);
                    self.set_state(ConnectionState::Stopped);
                    error!(attempts, reason = %reason, "Tool provider reconnect attempts exhausted");
                    let err = self.exhausted_error();
                    self.broadcast_to_clients(&error_frame(
                        Value::Null,
                        JsonRpcError {
                            code: error_codes::PROVIDER_UNAVAILABLE,
                            message: err.to_string(),
                            data: None,
                        },
                    ));
                    self.finish_attempt();
                    return;
                }
            }
        }
    }

    fn broadcast_to_clients(&self, frame: &str) {
        let targets: Vec<Arc<ClientHandle>> = match self.clients.lock() {
            Ok(mut clients) => {
                clients.retain(|_, weak| weak.strong_count() > 0);
                clients.values().filter_map(Weak::upgrade).collect()
            }
            Err(_) => return,
        };
        for client in targets {
            if let Err(e) = client.tx.try_send(frame.to_string()) {
                warn!(client = %client.id, error = %e, "Dropping frame for relay client");
            }
        }
    }

    async fn wait_for_attempt(&self) {
        loop {
            let notified = self.attempt_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.connecting.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    fn finish_attempt(&self) {
        self.connecting.store(false, Ordering::Release);
        self.attempt_done.notify_waiters();
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = %prev, to = %next, "Supervisor state changed");
        }
    }

    fn record_error(&self, reason: &str) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(reason.to_string());
        }
    }

    fn exhausted_error(&self) -> BridgeError {
        BridgeError::MaxReconnectExceeded {
            attempts: self.settings.max_reconnect_attempts,
        }
    }

    fn unavailable_error(&self) -> BridgeError {
        if self.exhausted.load(Ordering::SeqCst) {
            return self.exhausted_error();
        }
        let reason = self
            .last_error
            .lock()
            .ok()
            .and_then(|last| last.clone())
            .unwrap_or_else(|| format!("tool provider is {}", self.state()));
        BridgeError::ConnectFailed {
            attempts: self.reconnect_attempts.load(Ordering::SeqCst),
            reason,
        }
    }

    /// Wait out any attempt in flight and return the live process.
    async fn ready_process(&self) -> Result<Arc<ToolProviderProcess>, BridgeError> {
        self.wait_for_attempt().await;
        self.live_process()
            .await
            .ok_or_else(|| self.unavailable_error())
    }

    /// A call lost its connection. If the supervisor recovered, the call is
    /// reported as a plain tool failure so the model can retry it.
    async fn call_lost(&self, tool: &str, err: McpError) -> BridgeError {
        // Give the supervision loop a chance to notice the closed channel.
        tokio::task::yield_now().await;
        self.wait_for_attempt().await;
        if self.live_process().await.is_some() {
            BridgeError::ToolExecution {
                tool: tool.to_string(),
                message: format!("tool provider restarted during the call: {}", err),
            }
        } else {
            self.unavailable_error()
        }
    }
}

#[async_trait]
impl ToolBackend for ConnectionSupervisor {
    async fn connect(&self) -> Result<(), BridgeError> {
        self.start().await
    }

    async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolDefinition>, BridgeError> {
        let process = self.ready_process().await?;
        let tools = process
            .list_tools(timeout)
            .await
            .map_err(|e| BridgeError::CatalogUnavailable(e.to_string()))?;
        Ok(tools.into_iter().map(ToolDefinition::from).collect())
    }

    async fn call_tool(
        &self,
        call_id: &str,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<ToolResult, BridgeError> {
        let process = self.ready_process().await?;
        match process.call_tool(name, arguments, timeout).await {
            Ok(result) => {
                let content = result.text();
                Ok(ToolResult {
                    tool_call_id: call_id.to_string(),
                    content,
                    is_error: result.is_error,
                })
            }
            Err(McpError::Timeout { after, .. }) => Err(BridgeError::Timeout(after)),
            Err(e) if e.is_connection_loss() => {
                drop(process);
                Err(self.call_lost(name, e).await)
            }
            Err(e) => Err(BridgeError::ToolExecution {
                tool: name.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

fn error_frame(id: Value, error: JsonRpcError) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": error,
    })
    .to_string()
}
