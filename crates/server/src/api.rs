//! Health and status endpoints, plus the shared error body.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use toolbridge_mcp::SupervisorStatus;
use toolbridge_runtime::BridgeError;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorBody>);

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

/// Map a bridge failure to the status a client should see.
pub fn bridge_error(err: BridgeError) -> ApiError {
    let status = match &err {
        BridgeError::CatalogUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        BridgeError::ConnectFailed { .. } | BridgeError::MaxReconnectExceeded { .. } => {
            StatusCode::BAD_GATEWAY
        }
        BridgeError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        BridgeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        BridgeError::NotStarted | BridgeError::Busy => StatusCode::CONFLICT,
        BridgeError::ToolExecution { .. }
        | BridgeError::StreamProtocol(_)
        | BridgeError::ArgumentParse { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, err.to_string())
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub llm_configured: bool,
    pub tool_provider: String,
    pub sessions: usize,
    pub started_at: String,
    pub uptime_secs: i64,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        llm_configured: state.provider.is_some(),
        tool_provider: state.supervisor.state().to_string(),
        sessions: state.sessions.read().await.len(),
        started_at: state.started_at.to_rfc3339(),
        uptime_secs: (chrono::Utc::now() - state.started_at).num_seconds(),
    })
}

/// Status probe for the relay: supervisor state and registered clients.
pub async fn relay_status(State(state): State<Arc<AppState>>) -> Json<SupervisorStatus> {
    Json(state.supervisor.status())
}

/// Redacted configuration, safe to expose.
pub async fn config_summary(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.config.redacted_summary())
}
