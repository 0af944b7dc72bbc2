//! Anthropic Messages API adapter, speaking its SSE event set directly (§6 "Anthropic SSE"):
//! `message_start`, `content_block_start`/`_delta`/`_stop`, `message_delta`, `message_stop`.

use super::{response_byte_stream, sse_json_events};
use crate::cloudllm::context::{AgentContext, ContentPart, Role};
use crate::cloudllm::error::TransportError;
use crate::cloudllm::http_client_pool::get_or_create_client;
use crate::cloudllm::provider::{EventStream, ProviderAdapter, StopReason, StreamEvent, StreamOptions, Usage};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::collections::VecDeque;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    api_key: String,
    models: Vec<String>,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>, models: Vec<String>) -> Self {
        Self {
            api_key: api_key.into(),
            models,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_request_body(&self, model_id: &str, context: &AgentContext, options: &StreamOptions) -> Value {
        let mut system_text = String::new();
        let mut messages = Vec::new();
        for message in context.messages() {
            match message.role {
                Role::System => {
                    if !system_text.is_empty() {
                        system_text.push('\n');
                    }
                    system_text.push_str(&message.text_only());
                }
                Role::User => messages.push(json!({ "role": "user", "content": text_blocks(&message.content) })),
                Role::Assistant => {
                    messages.push(json!({ "role": "assistant", "content": assistant_blocks(&message.content) }))
                }
                Role::ToolResult => messages.push(json!({ "role": "user", "content": tool_result_blocks(&message.content) })),
            }
        }
        let mut body = json!({
            "model": model_id,
            "messages": messages,
            "max_tokens": options.max_tokens.unwrap_or(4096),
            "temperature": options.temperature,
            "stream": true,
        });
        if !system_text.is_empty() {
            body["system"] = json!(system_text);
        }
        if !options.tools.is_empty() {
            body["tools"] = json!(options
                .tools
                .iter()
                .map(|t| json!({ "name": t.name, "description": t.description, "input_schema": t.input_schema }))
                .collect::<Vec<_>>());
        }
        body
    }
}

fn text_blocks(parts: &[ContentPart]) -> Value {
    json!(parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(json!({ "type": "text", "text": text })),
            _ => None,
        })
        .collect::<Vec<_>>())
}

fn assistant_blocks(parts: &[ContentPart]) -> Value {
    json!(parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(json!({ "type": "text", "text": text })),
            ContentPart::Thinking { text } => Some(json!({ "type": "thinking", "thinking": text })),
            ContentPart::ToolCall { id, name, arguments } => {
                Some(json!({ "type": "tool_use", "id": id, "name": name, "input": arguments }))
            }
            _ => None,
        })
        .collect::<Vec<_>>())
}

fn tool_result_blocks(parts: &[ContentPart]) -> Value {
    json!(parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::ToolResult { tool_call_id, content, is_error } => Some(json!({
                "type": "tool_result",
                "tool_use_id": tool_call_id,
                "content": content,
                "is_error": is_error,
            })),
            _ => None,
        })
        .collect::<Vec<_>>())
}

#[derive(Default)]
struct BlockAcc {
    kind: String,
    id: String,
    name: String,
    partial_json: String,
}

fn map_stop_reason(raw: &str) -> StopReason {
    match raw {
        "max_tokens" => StopReason::MaxTokens,
        "tool_use" => StopReason::ToolUse,
        "stop_sequence" => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}

/// Translates one raw Anthropic SSE JSON payload into zero or more [`StreamEvent`]s, folding
/// `content_block_*` deltas into `blocks` by index until the block closes.
fn process_event(v: &Value, blocks: &mut HashMap<u64, BlockAcc>, usage: &mut Usage, stop_reason: &mut StopReason) -> Vec<StreamEvent> {
    let mut out = Vec::new();
    match v.get("type").and_then(Value::as_str) {
        Some("message_start") => {
            let message_id = v
                .pointer("/message/id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if let Some(input_tokens) = v.pointer("/message/usage/input_tokens").and_then(Value::as_u64) {
                usage.input_tokens = input_tokens;
            }
            out.push(StreamEvent::Start { message_id });
        }
        Some("content_block_start") => {
            if let Some(index) = v.get("index").and_then(Value::as_u64) {
                let block = v.get("content_block").cloned().unwrap_or(Value::Null);
                let kind = block.get("type").and_then(Value::as_str).unwrap_or("").to_string();
                let id = block.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                let name = block.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                blocks.insert(index, BlockAcc { kind, id, name, partial_json: String::new() });
            }
        }
        Some("content_block_delta") => {
            if let Some(index) = v.get("index").and_then(Value::as_u64) {
                let delta = v.get("delta").cloned().unwrap_or(Value::Null);
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            out.push(StreamEvent::Text { text: text.to_string() });
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(text) = delta.get("thinking").and_then(Value::as_str) {
                            out.push(StreamEvent::Thinking { text: text.to_string() });
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(acc) = blocks.get_mut(&index) {
                            if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
                                acc.partial_json.push_str(partial);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        Some("content_block_stop") => {
            if let Some(index) = v.get("index").and_then(Value::as_u64) {
                if let Some(acc) = blocks.remove(&index) {
                    if acc.kind == "tool_use" {
                        let arguments = if acc.partial_json.trim().is_empty() {
                            json!({})
                        } else {
                            serde_json::from_str(&acc.partial_json).unwrap_or(json!({}))
                        };
                        out.push(StreamEvent::ToolCall { id: acc.id, name: acc.name, arguments });
                    }
                }
            }
        }
        Some("message_delta") => {
            if let Some(raw) = v.pointer("/delta/stop_reason").and_then(Value::as_str) {
                *stop_reason = map_stop_reason(raw);
            }
            if let Some(output_tokens) = v.pointer("/usage/output_tokens").and_then(Value::as_u64) {
                usage.output_tokens = output_tokens;
            }
        }
        Some("message_stop") => {
            out.push(StreamEvent::Done { stop_reason: *stop_reason, usage: *usage, cost: None });
        }
        Some("error") => {
            let message = v
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("anthropic stream error")
                .to_string();
            out.push(StreamEvent::Error {
                error: TransportError {
                    provider_id: "anthropic".to_string(),
                    status_code: None,
                    message,
                    retryable: true,
                    retry_after_ms: None,
                },
            });
        }
        _ => {}
    }
    out
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> &str {
        "anthropic"
    }

    fn name(&self) -> &str {
        "Anthropic"
    }

    fn models(&self) -> &[String] {
        &self.models
    }

    async fn stream(&self, model_id: &str, context: &AgentContext, options: StreamOptions) -> EventStream {
        let client = get_or_create_client(&self.base_url);
        let body = self.build_request_body(model_id, context, &options);
        let request = client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("accept", "text/event-stream")
            .json(&body);

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let error = TransportError {
                    provider_id: "anthropic".to_string(),
                    status_code: None,
                    message: e.to_string(),
                    retryable: true,
                    retry_after_ms: None,
                };
                return Box::pin(stream::iter(vec![StreamEvent::Error { error }]));
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            let message = response.text().await.unwrap_or_default();
            let error = TransportError {
                provider_id: "anthropic".to_string(),
                status_code: Some(status),
                message,
                retryable: TransportError::retryable_for_status(status),
                retry_after_ms,
            };
            return Box::pin(stream::iter(vec![StreamEvent::Error { error }]));
        }

        let raw_events = sse_json_events(response_byte_stream(response));

        struct State {
            raw: std::pin::Pin<Box<dyn futures_util::Stream<Item = Value> + Send>>,
            blocks: HashMap<u64, BlockAcc>,
            usage: Usage,
            stop_reason: StopReason,
            pending: VecDeque<StreamEvent>,
        }
        Box::pin(stream::unfold(
            State {
                raw: raw_events,
                blocks: HashMap::new(),
                usage: Usage::default(),
                stop_reason: StopReason::EndTurn,
                pending: VecDeque::new(),
            },
            |mut state| async move {
                loop {
                    if let Some(event) = state.pending.pop_front() {
                        return Some((event, state));
                    }
                    match state.raw.next().await {
                        Some(v) => {
                            let mut produced = process_event(&v, &mut state.blocks, &mut state.usage, &mut state.stop_reason);
                            state.pending.extend(produced.drain(..));
                        }
                        None => return None,
                    }
                }
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_stop_emits_done_with_accumulated_usage() {
        let mut blocks = HashMap::new();
        let mut usage = Usage::default();
        let mut stop_reason = StopReason::EndTurn;
        process_event(&json!({"type": "message_start", "message": {"id": "m1", "usage": {"input_tokens": 12}}}), &mut blocks, &mut usage, &mut stop_reason);
        process_event(&json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 7}}), &mut blocks, &mut usage, &mut stop_reason);
        let out = process_event(&json!({"type": "message_stop"}), &mut blocks, &mut usage, &mut stop_reason);
        assert_eq!(out.len(), 1);
        match &out[0] {
            StreamEvent::Done { usage, stop_reason, .. } => {
                assert_eq!(usage.input_tokens, 12);
                assert_eq!(usage.output_tokens, 7);
                assert_eq!(*stop_reason, StopReason::EndTurn);
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn tool_use_block_accumulates_partial_json_until_stop() {
        let mut blocks = HashMap::new();
        let mut usage = Usage::default();
        let mut stop_reason = StopReason::EndTurn;
        process_event(
            &json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "tc-1", "name": "calculator"}}),
            &mut blocks,
            &mut usage,
            &mut stop_reason,
        );
        process_event(
            &json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"expression\""}}),
            &mut blocks,
            &mut usage,
            &mut stop_reason,
        );
        process_event(
            &json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": ":\"6*7\"}"}}),
            &mut blocks,
            &mut usage,
            &mut stop_reason,
        );
        let out = process_event(&json!({"type": "content_block_stop", "index": 0}), &mut blocks, &mut usage, &mut stop_reason);
        assert_eq!(out.len(), 1);
        match &out[0] {
            StreamEvent::ToolCall { id, name, arguments } => {
                assert_eq!(id, "tc-1");
                assert_eq!(name, "calculator");
                assert_eq!(arguments["expression"], "6*7");
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn text_delta_emits_text_event() {
        let mut blocks = HashMap::new();
        let mut usage = Usage::default();
        let mut stop_reason = StopReason::EndTurn;
        let out = process_event(
            &json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "hi"}}),
            &mut blocks,
            &mut usage,
            &mut stop_reason,
        );
        assert!(matches!(&out[0], StreamEvent::Text { text } if text == "hi"));
    }
}
