//! In-process tool providers for tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use toolbridge_runtime::ToolRegistry;

use crate::error::McpError;
use crate::process::{LaunchedProcess, ProcessLauncher};
use crate::server::{HostNotifier, McpServer};
use crate::transport::ChannelTransport;

/// Launches an [`McpServer`] over the built-in tools on a channel pair.
///
/// Launch failures and provider deaths can be scripted to drive the
/// supervisor through its state machine.
#[derive(Default)]
pub struct InProcessLauncher {
    launches: AtomicU32,
    fail_first: u32,
    fail_after: Option<u32>,
    delay: Duration,
    servers: Mutex<Vec<JoinHandle<()>>>,
    notifiers: Mutex<Vec<HostNotifier>>,
}

impl InProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `n` launches fail.
    pub fn failing_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    /// Every launch after the first `n` fails.
    pub fn failing_after(mut self, n: u32) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Each launch takes this long before the provider is reachable.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn launch_count(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    /// Make the most recently launched provider announce a tool list change.
    pub async fn announce_tools_changed(&self) -> Result<(), McpError> {
        let notifier = self
            .notifiers
            .lock()
            .ok()
            .and_then(|notifiers| notifiers.last().cloned())
            .ok_or(McpError::Terminated)?;
        notifier.tools_changed().await
    }

    /// Kill the most recently launched provider.
    pub fn kill_current(&self) {
        if let Ok(servers) = self.servers.lock() {
            if let Some(handle) = servers.last() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl ProcessLauncher for InProcessLauncher {
    async fn launch(&self) -> Result<LaunchedProcess, McpError> {
        let n = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if n <= self.fail_first || self.fail_after.map_or(false, |k| n > k) {
            return Err(McpError::LaunchFailed(format!("launch {} refused", n)));
        }

        let (client, server_side) = ChannelTransport::pair();
        let mut server = McpServer::new(ToolRegistry::with_builtin_tools());
        let notifier = server.notifier();
        let handle = tokio::spawn(async move {
            let (reader, writer) = server_side.split();
            let _ = server.serve(reader, writer).await;
        });
        if let Ok(mut servers) = self.servers.lock() {
            servers.push(handle);
        }
        if let Ok(mut notifiers) = self.notifiers.lock() {
            notifiers.push(notifier);
        }

        let (reader, writer) = client.split();
        Ok(LaunchedProcess {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        })
    }

    fn describe(&self) -> String {
        "in-process".to_string()
    }
}
