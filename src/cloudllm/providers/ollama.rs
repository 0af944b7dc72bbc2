//! Adapter for a locally hosted Ollama server's `/api/chat` endpoint — §6 "Ollama NDJSON":
//! one JSON object per line, a `message.content` text delta per line, and a terminal
//! `done: true` object carrying `prompt_eval_count`/`eval_count` in place of a `usage` block.

use super::{ndjson_events, response_byte_stream};
use crate::cloudllm::config::RuntimeConfig;
use crate::cloudllm::context::{AgentContext, ContentPart, Message, Role};
use crate::cloudllm::error::TransportError;
use crate::cloudllm::http_client_pool::get_or_create_client;
use crate::cloudllm::provider::{EventStream, ProviderAdapter, StopReason, StreamEvent, StreamOptions, Usage};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;

pub struct OllamaAdapter {
    models: Vec<String>,
    host: String,
}

impl OllamaAdapter {
    pub fn new(models: Vec<String>) -> Self {
        Self { models, host: RuntimeConfig::ollama_host() }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    fn build_request_body(&self, model_id: &str, context: &AgentContext, options: &StreamOptions) -> Value {
        let messages: Vec<Value> = context.messages().iter().map(to_ollama_message).collect();
        let mut body = json!({
            "model": model_id,
            "messages": messages,
            "stream": true,
            "options": { "temperature": options.temperature },
        });
        if !options.tools.is_empty() {
            body["tools"] = json!(options
                .tools
                .iter()
                .map(|t| json!({
                    "type": "function",
                    "function": { "name": t.name, "description": t.description, "parameters": t.input_schema },
                }))
                .collect::<Vec<_>>());
        }
        body
    }
}

fn to_ollama_message(message: &Message) -> Value {
    match message.role {
        Role::System => json!({ "role": "system", "content": message.text_only() }),
        Role::User => json!({ "role": "user", "content": message.text_only() }),
        Role::ToolResult => {
            let content = message
                .content
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ToolResult { content, .. } => Some(content.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            json!({ "role": "tool", "content": content })
        }
        Role::Assistant => {
            let text = message.text_only();
            let tool_calls: Vec<Value> = message
                .content
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ToolCall { name, arguments, .. } => {
                        Some(json!({ "function": { "name": name, "arguments": arguments } }))
                    }
                    _ => None,
                })
                .collect();
            let mut entry = json!({ "role": "assistant", "content": text });
            if !tool_calls.is_empty() {
                entry["tool_calls"] = json!(tool_calls);
            }
            entry
        }
    }
}

/// Folds one raw Ollama NDJSON object into the running state. Ollama has no block/index
/// structure: a tool call arrives whole in a single line's `message.tool_calls`, and lacking a
/// server-assigned id, one is minted from the call's position in that array.
fn process_line(v: &Value, started: &mut bool, usage: &mut Usage, next_tool_call_id: &mut u64) -> Vec<StreamEvent> {
    let mut out = Vec::new();
    if !*started {
        *started = true;
        out.push(StreamEvent::Start { message_id: String::new() });
    }

    if let Some(content) = v.pointer("/message/content").and_then(Value::as_str) {
        if !content.is_empty() {
            out.push(StreamEvent::Text { text: content.to_string() });
        }
    }

    if let Some(calls) = v.pointer("/message/tool_calls").and_then(Value::as_array) {
        for call in calls {
            let name = call.pointer("/function/name").and_then(Value::as_str).unwrap_or_default().to_string();
            let arguments = call.pointer("/function/arguments").cloned().unwrap_or(json!({}));
            let id = format!("ollama-call-{next_tool_call_id}");
            *next_tool_call_id += 1;
            out.push(StreamEvent::ToolCall { id, name, arguments });
        }
    }

    if v.get("done").and_then(Value::as_bool) == Some(true) {
        if let Some(prompt_eval_count) = v.get("prompt_eval_count").and_then(Value::as_u64) {
            usage.input_tokens = prompt_eval_count;
        }
        if let Some(eval_count) = v.get("eval_count").and_then(Value::as_u64) {
            usage.output_tokens = eval_count;
        }
        let has_tool_calls = v.pointer("/message/tool_calls").and_then(Value::as_array).map(|a| !a.is_empty()).unwrap_or(false);
        let stop_reason = if has_tool_calls { StopReason::ToolUse } else { StopReason::EndTurn };
        out.push(StreamEvent::Done { stop_reason, usage: *usage, cost: Some(0.0) });
    }

    out
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn id(&self) -> &str {
        "ollama"
    }

    fn name(&self) -> &str {
        "Ollama"
    }

    fn models(&self) -> &[String] {
        &self.models
    }

    async fn stream(&self, model_id: &str, context: &AgentContext, options: StreamOptions) -> EventStream {
        let client = get_or_create_client(&self.host);
        let body = self.build_request_body(model_id, context, &options);
        let request = client.post(format!("{}/api/chat", self.host)).json(&body);

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let error = TransportError {
                    provider_id: "ollama".to_string(),
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
            let message = response.text().await.unwrap_or_default();
            let error = TransportError {
                provider_id: "ollama".to_string(),
                status_code: Some(status),
                message,
                retryable: TransportError::retryable_for_status(status),
                retry_after_ms: None,
            };
            return Box::pin(stream::iter(vec![StreamEvent::Error { error }]));
        }

        let raw_events = ndjson_events(response_byte_stream(response));

        struct State {
            raw: std::pin::Pin<Box<dyn futures_util::Stream<Item = Value> + Send>>,
            started: bool,
            usage: Usage,
            next_tool_call_id: u64,
            pending: VecDeque<StreamEvent>,
        }
        Box::pin(stream::unfold(
            State {
                raw: raw_events,
                started: false,
                usage: Usage::default(),
                next_tool_call_id: 0,
                pending: VecDeque::new(),
            },
            |mut state| async move {
                loop {
                    if let Some(event) = state.pending.pop_front() {
                        return Some((event, state));
                    }
                    match state.raw.next().await {
                        Some(v) => {
                            let mut produced = process_line(&v, &mut state.started, &mut state.usage, &mut state.next_tool_call_id);
                            state.pending.extend(produced.drain(..));
                        }
                        None => return None,
                    }
                }
            },
        ))
    }

    async fn validate_key(&self, _key: &str) -> bool {
        // Ollama has no API key concept; any configured value is accepted.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_chunk_emits_start_then_text() {
        let mut started = false;
        let mut usage = Usage::default();
        let mut next_id = 0;
        let out = process_line(&json!({"message": {"content": "hi"}, "done": false}), &mut started, &mut usage, &mut next_id);
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], StreamEvent::Start { .. }));
        assert!(matches!(&out[1], StreamEvent::Text { text } if text == "hi"));
    }

    #[test]
    fn done_line_emits_usage_from_eval_counts() {
        let mut started = true;
        let mut usage = Usage::default();
        let mut next_id = 0;
        let out = process_line(
            &json!({"done": true, "prompt_eval_count": 15, "eval_count": 9}),
            &mut started,
            &mut usage,
            &mut next_id,
        );
        assert_eq!(out.len(), 1);
        match &out[0] {
            StreamEvent::Done { usage, stop_reason, .. } => {
                assert_eq!(usage.input_tokens, 15);
                assert_eq!(usage.output_tokens, 9);
                assert_eq!(*stop_reason, StopReason::EndTurn);
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn tool_call_line_mints_synthetic_id() {
        let mut started = true;
        let mut usage = Usage::default();
        let mut next_id = 0;
        let out = process_line(
            &json!({"message": {"tool_calls": [{"function": {"name": "calculator", "arguments": {"expression": "6*7"}}}]}}),
            &mut started,
            &mut usage,
            &mut next_id,
        );
        assert_eq!(out.len(), 1);
        match &out[0] {
            StreamEvent::ToolCall { id, name, .. } => {
                assert_eq!(id, "ollama-call-0");
                assert_eq!(name, "calculator");
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
        assert_eq!(next_id, 1);
    }
}
