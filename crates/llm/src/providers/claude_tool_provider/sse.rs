//! SSE event parsing and content-block state tracking for the Claude streaming API.

use serde_json::Value;
use tracing::{trace, warn};

use toolbridge_runtime::provider::LlmError;
use toolbridge_runtime::stream::{StopReason, StreamEvent};

/// Retry hint used when the provider does not send one.
pub(super) const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

/// Parse a single SSE event (type + data) into zero or more [`StreamEvent`]s.
///
/// An `error` event of type `rate_limit_error` becomes `Err(RateLimited)` so
/// the caller can tell throttling apart from a broken stream.
pub(super) fn parse_sse_event(event_type: &str, data: &str) -> Result<Vec<StreamEvent>, LlmError> {
    let mut events = Vec::new();

    match event_type {
        "content_block_start" => {
            if let Ok(parsed) = serde_json::from_str::<Value>(data) {
                let block = &parsed["content_block"];
                match block["type"].as_str() {
                    Some("text") => {
                        if let Some(text) = block["text"].as_str() {
                            if !text.is_empty() {
                                events.push(StreamEvent::TextDelta {
                                    text: text.to_string(),
                                });
                            }
                        }
                    }
                    Some("tool_use") => {
                        let id = block["id"].as_str().unwrap_or("").to_string();
                        let name = block["name"].as_str().unwrap_or("").to_string();
                        events.push(StreamEvent::ToolCallStart { id, name });
                    }
                    _ => {}
                }
            }
        }
        "content_block_delta" => {
            if let Ok(parsed) = serde_json::from_str::<Value>(data) {
                let delta = &parsed["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        if let Some(text) = delta["text"].as_str() {
                            events.push(StreamEvent::TextDelta {
                                text: text.to_string(),
                            });
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(json_str) = delta["partial_json"].as_str() {
                            // The block index stands in for the tool_use id until
                            // the decoder resolves it.
                            let index = parsed["index"].as_u64().unwrap_or(0);
                            events.push(StreamEvent::ToolCallDelta {
                                id: placeholder(index),
                                arguments_delta: json_str.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        "content_block_stop" => {
            if let Ok(parsed) = serde_json::from_str::<Value>(data) {
                let index = parsed["index"].as_u64().unwrap_or(0);
                events.push(StreamEvent::ToolCallEnd {
                    id: placeholder(index),
                });
            }
        }
        "message_delta" => {
            if let Ok(parsed) = serde_json::from_str::<Value>(data) {
                let stop_reason = match parsed["delta"]["stop_reason"].as_str() {
                    Some("end_turn") => StopReason::EndTurn,
                    Some("tool_use") => StopReason::ToolUse,
                    Some("max_tokens") => StopReason::MaxTokens,
                    Some("stop_sequence") => StopReason::StopSequence,
                    _ => StopReason::EndTurn,
                };
                events.push(StreamEvent::MessageEnd { stop_reason });
            }
        }
        // message_delta already carried the stop reason.
        "message_stop" | "message_start" | "ping" => {}
        "error" => {
            let parsed = serde_json::from_str::<Value>(data).ok();
            let error_type = parsed
                .as_ref()
                .and_then(|v| v["error"]["type"].as_str())
                .unwrap_or("");
            if error_type == "rate_limit_error" {
                let retry_after_secs = parsed
                    .as_ref()
                    .and_then(|v| v["error"]["retry_after_secs"].as_u64())
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                return Err(LlmError::RateLimited { retry_after_secs });
            }
            let message = parsed
                .as_ref()
                .and_then(|v| v["error"]["message"].as_str().map(String::from))
                .unwrap_or_else(|| data.to_string());
            events.push(StreamEvent::Error { message });
        }
        _ => {
            trace!(event_type, "ignoring unknown SSE event type");
        }
    }

    Ok(events)
}

fn placeholder(index: u64) -> String {
    format!("__index_{}", index)
}

/// Tracks per-block state so we can resolve `__index_N` placeholders to real
/// tool_use IDs and filter out spurious ToolCallEnd for text blocks.
pub(super) struct BlockTracker {
    /// Maps content-block index to (block_type, tool_use_id).
    blocks: Vec<(String, String)>,
}

impl BlockTracker {
    pub(super) fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    pub(super) fn register_block(&mut self, index: usize, block_type: &str, id: &str) {
        if index >= self.blocks.len() {
            self.blocks
                .resize(index + 1, (String::new(), String::new()));
        }
        self.blocks[index] = (block_type.to_string(), id.to_string());
    }

    pub(super) fn resolve(&self, placeholder_id: &str) -> Option<(String, String)> {
        if let Some(idx_str) = placeholder_id.strip_prefix("__index_") {
            if let Ok(idx) = idx_str.parse::<usize>() {
                return self.blocks.get(idx).cloned();
            }
        }
        None
    }
}

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence; only
/// complete lines are decoded.
#[derive(Default)]
pub(super) struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub(super) fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush an event left unterminated when the body ends.
    pub(super) fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
            if let Some(frame) = self.process_line(&line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.event.is_none() && self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        let event = self.event.take().unwrap_or_else(|| "message".to_string());
        Some(SseFrame { event, data })
    }
}

/// Turns raw response bytes into resolved [`StreamEvent`]s.
pub(super) struct ClaudeEventDecoder {
    sse: SseDecoder,
    tracker: BlockTracker,
}

impl ClaudeEventDecoder {
    pub(super) fn new() -> Self {
        Self {
            sse: SseDecoder::default(),
            tracker: BlockTracker::new(),
        }
    }

    pub(super) fn feed(&mut self, chunk: &[u8]) -> Vec<Result<StreamEvent, LlmError>> {
        let frames = self.sse.push(chunk);
        let mut out = Vec::new();
        for frame in frames {
            self.decode_frame(&frame, &mut out);
        }
        out
    }

    pub(super) fn finish(&mut self) -> Vec<Result<StreamEvent, LlmError>> {
        let mut out = Vec::new();
        if let Some(frame) = self.sse.finish() {
            self.decode_frame(&frame, &mut out);
        }
        out
    }

    fn decode_frame(&mut self, frame: &SseFrame, out: &mut Vec<Result<StreamEvent, LlmError>>) {
        if frame.event == "content_block_start" {
            if let Ok(parsed) = serde_json::from_str::<Value>(&frame.data) {
                let index = parsed["index"].as_u64().unwrap_or(0) as usize;
                let block = &parsed["content_block"];
                let block_type = block["type"].as_str().unwrap_or("");
                let id = block["id"].as_str().unwrap_or("");
                self.tracker.register_block(index, block_type, id);
            }
        }

        let events = match parse_sse_event(&frame.event, &frame.data) {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Claude stream reported an error");
                out.push(Err(e));
                return;
            }
        };

        for event in events {
            match event {
                StreamEvent::ToolCallDelta {
                    id,
                    arguments_delta,
                } => {
                    let id = match self.tracker.resolve(&id) {
                        Some((_, real_id)) => real_id,
                        None => id,
                    };
                    out.push(Ok(StreamEvent::ToolCallDelta {
                        id,
                        arguments_delta,
                    }));
                }
                StreamEvent::ToolCallEnd { id } => match self.tracker.resolve(&id) {
                    Some((block_type, real_id)) if block_type == "tool_use" => {
                        out.push(Ok(StreamEvent::ToolCallEnd { id: real_id }));
                    }
                    // Text and thinking blocks also send content_block_stop.
                    _ => {}
                },
                other => out.push(Ok(other)),
            }
        }
    }
}
