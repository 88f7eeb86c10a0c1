//! WebSocket relay between UI clients and the shared tool provider.
//!
//! Frames are passed through as opaque JSON-RPC text. Replies go back to the
//! client that sent the request; provider notifications reach every client.

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header::SEC_WEBSOCKET_PROTOCOL;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::api_error;
use crate::state::AppState;

/// Whether the client offered `required` in `Sec-WebSocket-Protocol`.
pub fn offers_subprotocol(headers: &HeaderMap, required: &str) -> bool {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim() == required)
}

pub async fn relay_upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let required = state.config.server.relay_subprotocol.clone();
    if !offers_subprotocol(&headers, &required) {
        warn!(required = %required, "Relay connection rejected: missing subprotocol");
        return api_error(
            StatusCode::BAD_REQUEST,
            format!("WebSocket subprotocol '{}' is required", required),
        )
        .into_response();
    }

    match ws {
        Ok(ws) => ws
            .protocols([required])
            .on_upgrade(move |socket| handle_relay(socket, state))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

async fn handle_relay(socket: WebSocket, state: Arc<AppState>) {
    // A failed start is not fatal here: relayed frames get error replies and
    // the client can stay connected.
    if let Err(e) = state.supervisor.start().await {
        warn!(error = %e, "Tool provider unavailable for relay client");
    }

    let (client, mut pushed) = state.supervisor.register_client();
    let client_id = client.id();
    info!(client = %client_id, clients = state.supervisor.client_count(), "Relay client connected");

    let (mut sender, mut receiver) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(64);

    // Replies and provider pushes share the socket's write half.
    let mut send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                Some(frame) = reply_rx.recv() => frame,
                Some(frame) = pushed.recv() => frame,
                else => break,
            };
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let supervisor = Arc::clone(&state.supervisor);
    let relay_client = Arc::clone(&client);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let frame = match msg {
                Message::Text(text) => text.as_str().to_owned(),
                Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Message::Close(_) => break,
                _ => continue,
            };
            debug!(client = %relay_client.id(), bytes = frame.len(), "Relaying client frame");

            // Requests run concurrently so a slow tool does not block the socket.
            let supervisor = Arc::clone(&supervisor);
            let from = Arc::clone(&relay_client);
            let reply_tx = reply_tx.clone();
            tokio::spawn(async move {
                if let Some(reply) = supervisor.relay(&frame, &from).await {
                    let _ = reply_tx.send(reply).await;
                }
            });
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.supervisor.deregister_client(client_id);
    drop(client);
    info!(client = %client_id, "Relay client disconnected");
}
