use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use toolbridge_core::Config;
use toolbridge_mcp::ConnectionSupervisor;
use toolbridge_runtime::{ConversationEngine, ToolAwareLlmProvider, ToolCatalog};

/// A session's engine. The mutex is held for the whole of a turn.
pub type SharedEngine = Arc<Mutex<ConversationEngine>>;

pub struct AppState {
    pub config: Config,
    pub supervisor: Arc<ConnectionSupervisor>,
    /// `None` when no model provider is configured; sessions are then refused.
    pub provider: Option<Arc<dyn ToolAwareLlmProvider>>,
    /// Fetched once by the first session that starts, then shared.
    pub catalog: RwLock<Option<Arc<ToolCatalog>>>,
    pub sessions: RwLock<HashMap<Uuid, SharedEngine>>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: Config,
        supervisor: Arc<ConnectionSupervisor>,
        provider: Option<Arc<dyn ToolAwareLlmProvider>>,
    ) -> Self {
        Self {
            config,
            supervisor,
            provider,
            catalog: RwLock::new(None),
            sessions: RwLock::new(HashMap::new()),
            started_at: Utc::now(),
        }
    }

    pub async fn session(&self, id: &Uuid) -> Option<SharedEngine> {
        self.sessions.read().await.get(id).cloned()
    }
}
