//! Conversation sessions: one [`ConversationEngine`] per session, turns
//! streamed to the client as SSE.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::Json;
use futures::stream::{self, Stream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use toolbridge_runtime::{
    configured_preamble, ConversationEngine, EngineConfig, Message, Notification, ToolBackend,
    TurnSummary,
};

use crate::api::{api_error, bridge_error, ApiError};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    /// Overrides the configured system prompt for this session.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionCreated {
    pub id: Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub tools: Vec<String>,
    pub max_depth: usize,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct SessionHistory {
    pub id: Uuid,
    pub messages: Vec<Message>,
}

/// Final SSE frame of a turn.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum TurnOutcome {
    Completed { summary: TurnSummary },
    Failed { error: String },
}

/// Create a session and start its engine.
///
/// Starting connects the shared tool provider and loads the catalog; the
/// catalog is fetched once and reused by later sessions.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CreateSessionRequest>>,
) -> Result<(StatusCode, Json<SessionCreated>), ApiError> {
    let provider = state.provider.clone().ok_or_else(|| {
        api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "LLM provider not configured. Check ANTHROPIC_API_KEY.",
        )
    })?;
    let req = body.map(|Json(req)| req).unwrap_or_default();

    let mut config = EngineConfig::from_config(&state.config);
    if let Some(prompt) = req.system_prompt {
        config.system_prompt = Some(prompt);
    }

    let backend: Arc<dyn ToolBackend> = state.supervisor.clone();
    let mut engine = ConversationEngine::new(provider, backend)
        .with_config(config)
        .with_preamble(configured_preamble(&state.config.engine));
    if let Some(catalog) = state.catalog.read().await.clone() {
        engine = engine.with_catalog(catalog);
    }

    engine.start().await.map_err(|e| {
        warn!(error = %e, "Session start failed");
        bridge_error(e)
    })?;

    if let Some(catalog) = engine.catalog() {
        let mut shared = state.catalog.write().await;
        if shared.is_none() {
            *shared = Some(Arc::clone(catalog));
        }
    }

    let id = Uuid::new_v4();
    let created = SessionCreated {
        id,
        created_at: chrono::Utc::now(),
        tools: engine
            .catalog()
            .map(|c| c.list().iter().map(|t| t.name.clone()).collect())
            .unwrap_or_default(),
        max_depth: engine.depth_bound(),
    };
    state
        .sessions
        .write()
        .await
        .insert(id, Arc::new(Mutex::new(engine)));

    info!(session = %id, tools = created.tools.len(), "Session created");
    Ok((StatusCode::CREATED, Json(created)))
}

/// Run one turn and stream its notifications.
///
/// Event names follow [`Notification::kind`]; the last event is `done`,
/// carrying the summary or the failure.
/// A session runs one turn at a time; a second request gets 409.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let engine = state
        .session(&id)
        .await
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Session not found: {}", id)))?;
    let mut engine = engine
        .try_lock_owned()
        .map_err(|_| bridge_error(toolbridge_runtime::BridgeError::Busy))?;

    let (tx, rx) = mpsc::channel::<Notification>(256);
    let (done_tx, done_rx) = oneshot::channel::<TurnOutcome>();

    tokio::spawn(async move {
        let outcome = match engine.send_message(req.text, &tx).await {
            Ok(summary) => {
                info!(
                    session = %id,
                    model_calls = summary.model_calls,
                    tool_calls = summary.tool_calls,
                    depth = summary.depth,
                    "Turn completed"
                );
                TurnOutcome::Completed { summary }
            }
            Err(e) => {
                // The engine has already sent the client-facing error notification.
                warn!(session = %id, error = %e, "Turn failed");
                TurnOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };
        drop(tx);
        let _ = done_tx.send(outcome);
    });

    let notifications = ReceiverStream::new(rx).map(|notification| {
        let data = serde_json::to_string(&notification).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(Event::default().event(notification.kind()).data(data))
    });
    let done = stream::once(async move {
        let outcome = done_rx.await.unwrap_or(TurnOutcome::Failed {
            error: "turn aborted".to_string(),
        });
        let data = serde_json::to_string(&outcome).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(Event::default().event("done").data(data))
    });

    Ok(Sse::new(notifications.chain(done)))
}

pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionHistory>, ApiError> {
    let engine = state
        .session(&id)
        .await
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Session not found: {}", id)))?;
    let engine = engine
        .try_lock()
        .map_err(|_| bridge_error(toolbridge_runtime::BridgeError::Busy))?;
    Ok(Json(SessionHistory {
        id,
        messages: engine.history().messages().to_vec(),
    }))
}

/// Drop a session. A turn still running keeps its engine until it ends.
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let engine = state
        .sessions
        .write()
        .await
        .remove(&id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Session not found: {}", id)))?;

    if let Ok(mut engine) = engine.try_lock() {
        engine.stop().await;
    }
    info!(session = %id, "Session deleted");
    Ok(StatusCode::NO_CONTENT)
}
