//! HTTP router construction.

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;
use crate::{api, relay, sessions};

/// Build the complete application router with all routes and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = match state.config.server.cors_origin.as_str() {
        "*" => CorsLayer::permissive(),
        origin => match origin.parse::<HeaderValue>() {
            Ok(value) => CorsLayer::permissive().allow_origin(value),
            Err(_) => CorsLayer::permissive(),
        },
    };

    Router::new()
        .route("/health", get(api::health))
        .route("/config", get(api::config_summary))
        .route("/relay", get(relay::relay_upgrade))
        .route("/relay/status", get(api::relay_status))
        .route("/sessions", post(sessions::create_session))
        .route("/sessions/{id}", axum::routing::delete(sessions::delete_session))
        .route("/sessions/{id}/messages", post(sessions::send_message))
        .route("/sessions/{id}/history", get(sessions::get_history))
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
    use tower::ServiceExt;

    use toolbridge_core::Config;
    use toolbridge_mcp::testing::InProcessLauncher;
    use toolbridge_mcp::{ConnectionSupervisor, ProcessLauncher, SupervisorSettings};
    use toolbridge_runtime::provider::mock::{MockFailure, MockLlmProvider};
    use toolbridge_runtime::ToolAwareLlmProvider;

    fn test_config() -> Config {
        let mut config = Config::for_profile("SRVROUTERTEST");
        config.server.relay_subprotocol = "mcp".to_string();
        config.server.cors_origin = "*".to_string();
        config.engine.max_depth = 4;
        config.engine.preamble = None;
        config
    }

    fn test_state(
        launcher: Arc<InProcessLauncher>,
        provider: Option<Arc<MockLlmProvider>>,
    ) -> Arc<AppState> {
        let supervisor = ConnectionSupervisor::new(
            launcher as Arc<dyn ProcessLauncher>,
            SupervisorSettings {
                max_reconnect_attempts: 1,
                backoff: Duration::from_millis(5),
                request_timeout: Duration::from_secs(5),
                client_name: "router-test".to_string(),
            },
        );
        let provider = provider.map(|p| p as Arc<dyn ToolAwareLlmProvider>);
        Arc::new(AppState::new(test_config(), supervisor, provider))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn create_session(state: &Arc<AppState>) -> String {
        let response = build_router(Arc::clone(state))
            .oneshot(post_json("/sessions", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        body["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let state = test_state(Arc::new(InProcessLauncher::new()), None);
        let response = build_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["llm_configured"], false);
        assert_eq!(body["tool_provider"], "stopped");
    }

    #[tokio::test]
    async fn test_relay_status_probe() {
        let launcher = Arc::new(InProcessLauncher::new());
        let state = test_state(Arc::clone(&launcher), None);
        state.supervisor.start().await.unwrap();
        let (_client, _rx) = state.supervisor.register_client();

        let response = build_router(Arc::clone(&state))
            .oneshot(Request::get("/relay/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["running"], true);
        assert_eq!(body["state"], "ready");
        assert_eq!(body["clients"], 1);
        assert_eq!(body["reconnect_attempts"], 0);
    }

    #[tokio::test]
    async fn test_relay_requires_subprotocol() {
        let launcher = Arc::new(InProcessLauncher::new());
        let state = test_state(Arc::clone(&launcher), None);

        let request = Request::get("/relay")
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();
        let response = build_router(state).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("mcp"));
        assert_eq!(launcher.launch_count(), 0);
    }

    async fn next_frame<S>(ws: &mut S) -> Value
    where
        S: futures::Stream<Item = Result<WsMessage, WsError>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_relay_websocket_round_trip() {
        let launcher = Arc::new(InProcessLauncher::new());
        let state = test_state(Arc::clone(&launcher), None);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut request = format!("ws://{}/relay", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("sec-websocket-protocol", "mcp".parse().unwrap());
        let (mut ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
        assert_eq!(response.headers()["sec-websocket-protocol"], "mcp");

        ws.send(WsMessage::Text(
            r#"{"jsonrpc":"2.0","id":"ui-1","method":"tools/list"}"#.to_string(),
        ))
        .await
        .unwrap();
        let reply = next_frame(&mut ws).await;
        assert_eq!(reply["id"], "ui-1");
        assert_eq!(reply["result"]["tools"].as_array().unwrap().len(), 2);
        assert_eq!(state.supervisor.status().clients, 1);

        launcher.announce_tools_changed().await.unwrap();
        let pushed = next_frame(&mut ws).await;
        assert_eq!(pushed["method"], "notifications/tools/list_changed");
        assert!(pushed.get("id").is_none());

        ws.close(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while state.supervisor.status().clients != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(state.supervisor.status().running);
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_create_session_without_provider() {
        let state = test_state(Arc::new(InProcessLauncher::new()), None);
        let response = build_router(state)
            .oneshot(post_json("/sessions", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_create_session_when_provider_cannot_start() {
        let launcher = Arc::new(InProcessLauncher::new().failing_first(10));
        let provider = Arc::new(MockLlmProvider::new());
        let state = test_state(Arc::clone(&launcher), Some(provider));

        let response = build_router(state)
            .oneshot(post_json("/sessions", json!({})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert!(body["error"].as_str().is_some());
        // One spawn plus one retry.
        assert_eq!(launcher.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_create_session_lists_tools_and_shares_catalog() {
        let launcher = Arc::new(InProcessLauncher::new());
        let provider = Arc::new(MockLlmProvider::new());
        let state = test_state(Arc::clone(&launcher), Some(provider));

        let response = build_router(Arc::clone(&state))
            .oneshot(post_json("/sessions", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["tools"], json!(["echo", "sum"]));
        assert_eq!(body["max_depth"], 4);

        assert!(state.catalog.read().await.is_some());
        create_session(&state).await;
        assert_eq!(state.sessions.read().await.len(), 2);
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_send_message_streams_notifications_and_done() {
        let provider = Arc::new(MockLlmProvider::new());
        provider.queue_tool_call("toolu_1", "sum", &["{\"values\":", "[40,2]}"]);
        provider.queue_text("The answer is 42.");
        let state = test_state(Arc::new(InProcessLauncher::new()), Some(Arc::clone(&provider)));
        let id = create_session(&state).await;

        let response = build_router(Arc::clone(&state))
            .oneshot(post_json(
                &format!("/sessions/{}/messages", id),
                json!({"text": "add 40 and 2"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let text = body_text(response).await;
        assert!(text.contains("event: tool_invoked"), "{}", text);
        assert!(text.contains("event: tool_finished"), "{}", text);
        assert!(text.contains("event: assistant_delta"), "{}", text);
        assert!(text.contains("The answer is 42."), "{}", text);
        let done = text.find("event: done").unwrap();
        assert!(done > text.find("event: assistant_delta").unwrap());
        assert!(text.contains("\"status\":\"completed\""), "{}", text);
        assert_eq!(provider.call_count(), 2);

        let response = build_router(Arc::clone(&state))
            .oneshot(
                Request::get(format!("/sessions/{}/history", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let history = body_json(response).await;
        let messages = history["messages"].as_array().unwrap();
        assert_eq!(messages.first().unwrap()["role"], "user");
        assert!(messages.iter().any(|m| m["role"] == "tool" && m["tool_name"] == "sum"));
        assert_eq!(messages.last().unwrap()["content"], "The answer is 42.");
    }

    #[tokio::test]
    async fn test_failed_turn_reports_one_error() {
        let provider = Arc::new(MockLlmProvider::new());
        provider.queue_refusal(MockFailure::Network("connection reset".to_string()));
        let state = test_state(Arc::new(InProcessLauncher::new()), Some(Arc::clone(&provider)));
        let id = create_session(&state).await;

        let response = build_router(Arc::clone(&state))
            .oneshot(post_json(
                &format!("/sessions/{}/messages", id),
                json!({"text": "hello"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let text = body_text(response).await;
        assert_eq!(text.matches("event: error").count(), 1, "{}", text);
        let error_at = text.find("event: error").unwrap();
        let done_at = text.find("event: done").unwrap();
        assert!(error_at < done_at);
        assert!(!text[error_at..done_at].contains("connection reset"), "{}", text);
        assert!(text[done_at..].contains("\"status\":\"failed\""), "{}", text);
    }

    #[tokio::test]
    async fn test_send_message_while_turn_running_is_busy() {
        let provider = Arc::new(MockLlmProvider::new());
        let state = test_state(Arc::new(InProcessLauncher::new()), Some(provider));
        let id = create_session(&state).await;

        let engine = state.session(&id.parse().unwrap()).await.unwrap();
        let _guard = engine.lock().await;

        let response = build_router(Arc::clone(&state))
            .oneshot(post_json(
                &format!("/sessions/{}/messages", id),
                json!({"text": "hello"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let state = test_state(
            Arc::new(InProcessLauncher::new()),
            Some(Arc::new(MockLlmProvider::new())),
        );
        let id = uuid::Uuid::new_v4();

        let response = build_router(Arc::clone(&state))
            .oneshot(post_json(
                &format!("/sessions/{}/messages", id),
                json!({"text": "hello"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = build_router(state)
            .oneshot(
                Request::delete(format!("/sessions/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_session_keeps_provider_running() {
        let state = test_state(
            Arc::new(InProcessLauncher::new()),
            Some(Arc::new(MockLlmProvider::new())),
        );
        let id = create_session(&state).await;

        let response = build_router(Arc::clone(&state))
            .oneshot(
                Request::delete(format!("/sessions/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(state.sessions.read().await.is_empty());
        assert!(state.supervisor.status().running);
    }
}
