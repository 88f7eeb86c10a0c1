//! Unit tests for the Claude tool provider.

use futures::StreamExt;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use toolbridge_runtime::conversation::Message;
use toolbridge_runtime::provider::{LlmError, ToolAwareLlmProvider};
use toolbridge_runtime::stream::{StopReason, StreamEvent};
use toolbridge_runtime::tool::ToolDefinition;

use super::sse::{parse_sse_event, BlockTracker, ClaudeEventDecoder, SseDecoder};
use super::streaming::error_for_status;
use super::translate::{messages_to_claude, tool_definition_to_claude};
use super::ClaudeToolProvider;

const TOOL_USE_TRANSCRIPT: &str = concat!(
    "event: message_start\n",
    "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\"}}\n\n",
    "event: content_block_start\n",
    "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
    "event: content_block_delta\n",
    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Adding.\"}}\n\n",
    "event: content_block_stop\n",
    "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
    "event: content_block_start\n",
    "data: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_sum\",\"name\":\"sum\"}}\n\n",
    "event: ping\n",
    "data: {}\n\n",
    "event: content_block_delta\n",
    "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"values\\\":\"}}\n\n",
    "event: content_block_delta\n",
    "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"[40,2]}\"}}\n\n",
    "event: content_block_stop\n",
    "data: {\"type\":\"content_block_stop\",\"index\":1}\n\n",
    "event: message_delta\n",
    "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"}}\n\n",
    "event: message_stop\n",
    "data: {\"type\":\"message_stop\"}\n\n",
);

fn expected_transcript_events() -> Vec<StreamEvent> {
    vec![
        StreamEvent::TextDelta {
            text: "Adding.".to_string(),
        },
        StreamEvent::ToolCallStart {
            id: "toolu_sum".to_string(),
            name: "sum".to_string(),
        },
        StreamEvent::ToolCallDelta {
            id: "toolu_sum".to_string(),
            arguments_delta: "{\"values\":".to_string(),
        },
        StreamEvent::ToolCallDelta {
            id: "toolu_sum".to_string(),
            arguments_delta: "[40,2]}".to_string(),
        },
        StreamEvent::ToolCallEnd {
            id: "toolu_sum".to_string(),
        },
        StreamEvent::MessageEnd {
            stop_reason: StopReason::ToolUse,
        },
    ]
}

fn decode_all(decoder: &mut ClaudeEventDecoder, chunks: &[&[u8]]) -> Vec<StreamEvent> {
    let mut out = Vec::new();
    for chunk in chunks {
        out.extend(decoder.feed(chunk).into_iter().map(|r| r.unwrap()));
    }
    out.extend(decoder.finish().into_iter().map(|r| r.unwrap()));
    out
}

#[test]
fn test_tool_definition_translation() {
    let def = ToolDefinition {
        name: "sum".to_string(),
        description: "Add numbers".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "values": { "type": "array", "items": { "type": "number" } }
            },
            "required": ["values"]
        }),
    };

    let claude_json = tool_definition_to_claude(&def);

    assert_eq!(claude_json["name"], "sum");
    assert_eq!(claude_json["description"], "Add numbers");
    assert_eq!(claude_json["input_schema"]["type"], "object");
    assert_eq!(
        claude_json["input_schema"]["properties"]["values"]["type"],
        "array"
    );
}

#[test]
fn test_messages_translation_roles() {
    let messages = vec![
        Message::user("Hello Claude"),
        Message::assistant("Hi there."),
    ];
    let out = messages_to_claude(&messages);

    assert_eq!(out.len(), 2);
    assert_eq!(out[0], json!({"role": "user", "content": "Hello Claude"}));
    assert_eq!(out[1], json!({"role": "assistant", "content": "Hi there."}));
}

#[test]
fn test_messages_translation_skips_tool_and_empty() {
    let messages = vec![
        Message::user("add 40 and 2"),
        Message::assistant(""),
        Message::tool("toolu_1#1", "sum", json!({"values": [40, 2]})),
        Message::assistant("42"),
    ];
    let out = messages_to_claude(&messages);

    assert_eq!(out.len(), 2);
    assert_eq!(out[0]["role"], "user");
    assert_eq!(out[1]["role"], "assistant");
    assert_eq!(out[1]["content"], "42");
}

#[test]
fn test_messages_translation_merges_same_role() {
    let messages = vec![
        Message::user("first"),
        Message::assistant("one"),
        Message::assistant("two"),
    ];
    let out = messages_to_claude(&messages);

    assert_eq!(out.len(), 2);
    assert_eq!(out[1]["content"], "one\n\ntwo");
}

#[test]
fn test_sse_text_delta() {
    let events = parse_sse_event(
        "content_block_delta",
        r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
    )
    .unwrap();
    assert_eq!(
        events,
        vec![StreamEvent::TextDelta {
            text: "Hello".to_string()
        }]
    );
}

#[test]
fn test_sse_tool_call_start() {
    let events = parse_sse_event(
        "content_block_start",
        r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_abc","name":"echo"}}"#,
    )
    .unwrap();
    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::ToolCallStart { id, name } => {
            assert_eq!(id, "toolu_abc");
            assert_eq!(name, "echo");
        }
        other => panic!("expected ToolCallStart, got {:?}", other),
    }
}

#[test]
fn test_sse_tool_call_delta_uses_placeholder() {
    let events = parse_sse_event(
        "content_block_delta",
        r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"message\":"}}"#,
    )
    .unwrap();
    match &events[0] {
        StreamEvent::ToolCallDelta {
            id,
            arguments_delta,
        } => {
            assert_eq!(id, "__index_1");
            assert_eq!(arguments_delta, "{\"message\":");
        }
        other => panic!("expected ToolCallDelta, got {:?}", other),
    }
}

#[test]
fn test_sse_message_delta_stop_reasons() {
    let end_turn = parse_sse_event(
        "message_delta",
        r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":42}}"#,
    )
    .unwrap();
    assert_eq!(
        end_turn,
        vec![StreamEvent::MessageEnd {
            stop_reason: StopReason::EndTurn
        }]
    );

    let tool_use = parse_sse_event(
        "message_delta",
        r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"}}"#,
    )
    .unwrap();
    assert_eq!(
        tool_use,
        vec![StreamEvent::MessageEnd {
            stop_reason: StopReason::ToolUse
        }]
    );
}

#[test]
fn test_sse_error_event() {
    let events = parse_sse_event(
        "error",
        r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
    )
    .unwrap();
    assert_eq!(
        events,
        vec![StreamEvent::Error {
            message: "Overloaded".to_string()
        }]
    );
}

#[test]
fn test_sse_rate_limit_error_event() {
    let err = parse_sse_event(
        "error",
        r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#,
    )
    .unwrap_err();
    assert!(matches!(err, LlmError::RateLimited { retry_after_secs: 30 }));
}

#[test]
fn test_sse_ping_and_message_stop_ignored() {
    assert!(parse_sse_event("ping", "{}").unwrap().is_empty());
    assert!(parse_sse_event("message_stop", r#"{"type":"message_stop"}"#)
        .unwrap()
        .is_empty());
}

#[test]
fn test_block_tracker_resolution() {
    let mut tracker = BlockTracker::new();
    tracker.register_block(0, "text", "");
    tracker.register_block(1, "tool_use", "toolu_abc");

    let resolved = tracker.resolve("__index_1").unwrap();
    assert_eq!(resolved.0, "tool_use");
    assert_eq!(resolved.1, "toolu_abc");

    let resolved_text = tracker.resolve("__index_0").unwrap();
    assert_eq!(resolved_text.0, "text");

    assert!(tracker.resolve("__index_99").is_none());
    assert!(tracker.resolve("not_a_placeholder").is_none());
}

#[test]
fn test_sse_decoder_handles_split_lines_and_comments() {
    let mut decoder = SseDecoder::default();
    assert!(decoder.push(b": keep-alive\nevent: pi").is_empty());
    assert!(decoder.push(b"ng\r\ndata: {}").is_empty());
    let frames = decoder.push(b"\r\n\r\n");

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].event, "ping");
    assert_eq!(frames[0].data, "{}");
}

#[test]
fn test_sse_decoder_joins_multiline_data() {
    let mut decoder = SseDecoder::default();
    let frames = decoder.push(b"data: first\ndata: second\n\n");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].event, "message");
    assert_eq!(frames[0].data, "first\nsecond");
}

#[test]
fn test_sse_decoder_flushes_unterminated_event() {
    let mut decoder = SseDecoder::default();
    assert!(decoder.push(b"event: message_stop\ndata: {}").is_empty());
    let frame = decoder.finish().unwrap();
    assert_eq!(frame.event, "message_stop");
    assert!(decoder.finish().is_none());
}

#[test]
fn test_decoder_full_tool_use_transcript() {
    let mut decoder = ClaudeEventDecoder::new();
    let events = decode_all(&mut decoder, &[TOOL_USE_TRANSCRIPT.as_bytes()]);
    assert_eq!(events, expected_transcript_events());
}

#[test]
fn test_decoder_is_chunking_independent() {
    let bytes = TOOL_USE_TRANSCRIPT.as_bytes();
    for size in [1usize, 3, 7, 64] {
        let chunks: Vec<&[u8]> = bytes.chunks(size).collect();
        let mut decoder = ClaudeEventDecoder::new();
        let events = decode_all(&mut decoder, &chunks);
        assert_eq!(events, expected_transcript_events(), "chunk size {}", size);
    }
}

#[test]
fn test_decoder_keeps_multibyte_text_split_across_chunks() {
    let body = "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"caf\u{e9} \u{2713}\"}}\n\n";
    let bytes = body.as_bytes();
    let split = body.find('\u{e9}').unwrap() + 1;

    let mut decoder = ClaudeEventDecoder::new();
    let events = decode_all(&mut decoder, &[&bytes[..split], &bytes[split..]]);
    assert_eq!(
        events,
        vec![StreamEvent::TextDelta {
            text: "caf\u{e9} \u{2713}".to_string()
        }]
    );
}

#[test]
fn test_decoder_text_block_stop_emits_nothing() {
    let body = concat!(
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
    );
    let mut decoder = ClaudeEventDecoder::new();
    let events = decode_all(&mut decoder, &[body.as_bytes()]);
    assert!(events.is_empty(), "got {:?}", events);
}

#[test]
fn test_decoder_surfaces_rate_limit_as_error() {
    let body = "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"rate_limit_error\",\"retry_after_secs\":5}}\n\n";
    let mut decoder = ClaudeEventDecoder::new();
    let results = decoder.feed(body.as_bytes());
    assert_eq!(results.len(), 1);
    assert!(matches!(
        results[0],
        Err(LlmError::RateLimited { retry_after_secs: 5 })
    ));
}

#[test]
fn test_error_for_status_mapping() {
    assert!(matches!(error_for_status(401, None, ""), LlmError::AuthError));
    assert!(matches!(
        error_for_status(429, Some(12), "{}"),
        LlmError::RateLimited { retry_after_secs: 12 }
    ));
    assert!(matches!(
        error_for_status(
            429,
            None,
            r#"{"error":{"type":"rate_limit_error","retry_after_secs":7}}"#
        ),
        LlmError::RateLimited { retry_after_secs: 7 }
    ));
    assert!(matches!(
        error_for_status(429, None, "busy"),
        LlmError::RateLimited { retry_after_secs: 30 }
    ));
    match error_for_status(500, None, "boom") {
        LlmError::ApiError { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "boom");
        }
        other => panic!("expected ApiError, got {:?}", other),
    }
}

/// Serve exactly one HTTP response on an ephemeral port.
async fn serve_once(response: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("content-length")
                            .then(|| v.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if request.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.unwrap();
    });

    format!("http://{}", addr)
}

#[tokio::test]
async fn test_stream_with_tools_over_http() {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n{}",
        TOOL_USE_TRANSCRIPT
    );
    let base_url = serve_once(response).await;
    let provider = ClaudeToolProvider::new("test-key".into(), "test-model".into(), base_url);

    let stream = provider
        .stream_with_tools(vec![Message::user("add 40 and 2")], None, vec![], 0.0, 256)
        .await
        .unwrap();
    let events: Vec<StreamEvent> = stream.map(|r| r.unwrap()).collect().await;

    assert_eq!(events, expected_transcript_events());
    assert_eq!(provider.provider_name(), "claude");
}

#[tokio::test]
async fn test_stream_with_tools_rate_limited_uses_retry_after_header() {
    let body = r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#;
    let response = format!(
        "HTTP/1.1 429 Too Many Requests\r\nContent-Type: application/json\r\nretry-after: 9\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let base_url = serve_once(response).await;
    let provider = ClaudeToolProvider::new("test-key".into(), "test-model".into(), base_url);

    let result = provider
        .stream_with_tools(vec![Message::user("hi")], None, vec![], 0.0, 256)
        .await;

    match result {
        Err(LlmError::RateLimited { retry_after_secs }) => assert_eq!(retry_after_secs, 9),
        Err(other) => panic!("expected RateLimited, got {:?}", other),
        Ok(_) => panic!("expected RateLimited, got a stream"),
    }
}
