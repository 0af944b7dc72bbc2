//! Adapter for OpenAI's Chat Completions API and the many providers that mirror its wire
//! format (Groq, Cerebras, Mistral, DeepSeek, OpenRouter, Together, ...) — §6
//! "OpenAI-compatible SSE": `choices[0].delta`, by-index incremental `tool_calls` assembly,
//! a terminal `data: [DONE]` line, and an optional `usage` object gated behind
//! `stream_options.include_usage`.

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

/// Which provider identity this adapter presents as; every field besides `id`/`name` behaves
/// identically since the wire format is shared.
pub struct OpenAiCompatibleAdapter {
    id: String,
    name: String,
    api_key: String,
    models: Vec<String>,
    base_url: String,
}

impl OpenAiCompatibleAdapter {
    pub fn new(id: impl Into<String>, name: impl Into<String>, api_key: impl Into<String>, base_url: impl Into<String>, models: Vec<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            api_key: api_key.into(),
            models,
            base_url: base_url.into(),
        }
    }

    pub fn openai(api_key: impl Into<String>, models: Vec<String>) -> Self {
        Self::new("openai", "OpenAI", api_key, "https://api.openai.com", models)
    }

    fn build_request_body(&self, model_id: &str, context: &AgentContext, options: &StreamOptions) -> Value {
        let messages: Vec<Value> = context.messages().iter().map(to_openai_message).collect();
        let mut body = json!({
            "model": model_id,
            "messages": messages,
            "temperature": options.temperature,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
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

fn to_openai_message(message: &crate::cloudllm::context::Message) -> Value {
    match message.role {
        Role::System => json!({ "role": "system", "content": message.text_only() }),
        Role::User => json!({ "role": "user", "content": message.text_only() }),
        Role::ToolResult => {
            let parts: Vec<Value> = message
                .content
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ToolResult { tool_call_id, content, .. } => {
                        Some(json!({ "role": "tool", "tool_call_id": tool_call_id, "content": content }))
                    }
                    _ => None,
                })
                .collect();
            // OpenAI has no multi-result single message; emit the first and let the caller's
            // loop append one Message per dispatched tool call (§4.6 always does).
            parts.into_iter().next().unwrap_or(json!({ "role": "tool", "content": "" }))
        }
        Role::Assistant => {
            let text: String = message.text_only();
            let tool_calls: Vec<Value> = message
                .content
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ToolCall { id, name, arguments } => Some(json!({
                        "id": id,
                        "type": "function",
                        "function": { "name": name, "arguments": arguments.to_string() },
                    })),
                    _ => None,
                })
                .collect();
            let mut entry = json!({ "role": "assistant", "content": if text.is_empty() { Value::Null } else { json!(text) } });
            if !tool_calls.is_empty() {
                entry["tool_calls"] = json!(tool_calls);
            }
            entry
        }
    }
}

#[derive(Default, Clone)]
struct ToolCallAcc {
    id: String,
    name: String,
    arguments: String,
}

fn map_finish_reason(raw: &str) -> StopReason {
    match raw {
        "length" => StopReason::MaxTokens,
        "tool_calls" => StopReason::ToolUse,
        "stop_sequence" => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}

/// Folds one raw `choices[0].delta` chunk into the running state, returning any events it
/// completes. `tool_calls` arrive keyed by array index, with `id`/`function.name` only on the
/// first chunk for that index and `function.arguments` arriving incrementally thereafter.
fn process_chunk(
    v: &Value,
    started: &mut bool,
    tool_calls: &mut HashMap<u64, ToolCallAcc>,
    usage: &mut Usage,
    stop_reason: &mut StopReason,
) -> Vec<StreamEvent> {
    let mut out = Vec::new();
    if !*started {
        *started = true;
        let message_id = v.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
        out.push(StreamEvent::Start { message_id });
    }

    if let Some(usage_obj) = v.get("usage") {
        if let Some(prompt) = usage_obj.get("prompt_tokens").and_then(Value::as_u64) {
            usage.input_tokens = prompt;
        }
        if let Some(completion) = usage_obj.get("completion_tokens").and_then(Value::as_u64) {
            usage.output_tokens = completion;
        }
    }

    let choice = v.pointer("/choices/0");
    let delta = choice.and_then(|c| c.get("delta"));

    if let Some(content) = delta.and_then(|d| d.get("content")).and_then(Value::as_str) {
        out.push(StreamEvent::Text { text: content.to_string() });
    }

    if let Some(calls) = delta.and_then(|d| d.get("tool_calls")).and_then(Value::as_array) {
        for call in calls {
            let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
            let acc = tool_calls.entry(index).or_default();
            if let Some(id) = call.get("id").and_then(Value::as_str) {
                acc.id = id.to_string();
            }
            if let Some(name) = call.pointer("/function/name").and_then(Value::as_str) {
                acc.name = name.to_string();
            }
            if let Some(args) = call.pointer("/function/arguments").and_then(Value::as_str) {
                acc.arguments.push_str(args);
            }
        }
    }

    if let Some(finish_reason) = choice.and_then(|c| c.get("finish_reason")).and_then(Value::as_str) {
        *stop_reason = map_finish_reason(finish_reason);
        if finish_reason == "tool_calls" {
            for (_, acc) in tool_calls.drain() {
                let arguments = if acc.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&acc.arguments).unwrap_or(json!({}))
                };
                out.push(StreamEvent::ToolCall { id: acc.id, name: acc.name, arguments });
            }
        }
    }

    out
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn models(&self) -> &[String] {
        &self.models
    }

    async fn stream(&self, model_id: &str, context: &AgentContext, options: StreamOptions) -> EventStream {
        let client = get_or_create_client(&self.base_url);
        let body = self.build_request_body(model_id, context, &options);
        let request = client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("accept", "text/event-stream")
            .json(&body);

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let error = TransportError {
                    provider_id: self.id.clone(),
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
                provider_id: self.id.clone(),
                status_code: Some(status),
                message,
                retryable: TransportError::retryable_for_status(status),
                retry_after_ms: None,
            };
            return Box::pin(stream::iter(vec![StreamEvent::Error { error }]));
        }

        let raw_events = sse_json_events(response_byte_stream(response));

        struct State {
            raw: std::pin::Pin<Box<dyn futures_util::Stream<Item = Value> + Send>>,
            started: bool,
            tool_calls: HashMap<u64, ToolCallAcc>,
            usage: Usage,
            stop_reason: StopReason,
            pending: VecDeque<StreamEvent>,
            done_emitted: bool,
        }
        Box::pin(stream::unfold(
            State {
                raw: raw_events,
                started: false,
                tool_calls: HashMap::new(),
                usage: Usage::default(),
                stop_reason: StopReason::EndTurn,
                pending: VecDeque::new(),
                done_emitted: false,
            },
            |mut state| async move {
                loop {
                    if let Some(event) = state.pending.pop_front() {
                        return Some((event, state));
                    }
                    match state.raw.next().await {
                        Some(v) => {
                            let mut produced =
                                process_chunk(&v, &mut state.started, &mut state.tool_calls, &mut state.usage, &mut state.stop_reason);
                            state.pending.extend(produced.drain(..));
                        }
                        None => {
                            if state.done_emitted {
                                return None;
                            }
                            state.done_emitted = true;
                            return Some((
                                StreamEvent::Done { stop_reason: state.stop_reason, usage: state.usage, cost: None },
                                state,
                            ));
                        }
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
    fn text_delta_chunk_emits_start_then_text() {
        let mut started = false;
        let mut tool_calls = HashMap::new();
        let mut usage = Usage::default();
        let mut stop_reason = StopReason::EndTurn;
        let out = process_chunk(
            &json!({"id": "chatcmpl-1", "choices": [{"delta": {"content": "hi"}}]}),
            &mut started,
            &mut tool_calls,
            &mut usage,
            &mut stop_reason,
        );
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], StreamEvent::Start { .. }));
        assert!(matches!(&out[1], StreamEvent::Text { text } if text == "hi"));
    }

    #[test]
    fn tool_call_assembled_across_indexed_chunks_on_finish() {
        let mut started = true;
        let mut tool_calls = HashMap::new();
        let mut usage = Usage::default();
        let mut stop_reason = StopReason::EndTurn;
        process_chunk(
            &json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "id": "tc-1", "function": {"name": "calculator", "arguments": ""}}]}}]}),
            &mut started,
            &mut tool_calls,
            &mut usage,
            &mut stop_reason,
        );
        process_chunk(
            &json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": "{\"expression\":\"6*7\"}"}}]}}]}),
            &mut started,
            &mut tool_calls,
            &mut usage,
            &mut stop_reason,
        );
        let out = process_chunk(
            &json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
            &mut started,
            &mut tool_calls,
            &mut usage,
            &mut stop_reason,
        );
        assert_eq!(out.len(), 1);
        match &out[0] {
            StreamEvent::ToolCall { id, name, arguments } => {
                assert_eq!(id, "tc-1");
                assert_eq!(name, "calculator");
                assert_eq!(arguments["expression"], "6*7");
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
        assert_eq!(stop_reason, StopReason::ToolUse);
    }

    #[test]
    fn usage_object_updates_running_totals() {
        let mut started = true;
        let mut tool_calls = HashMap::new();
        let mut usage = Usage::default();
        let mut stop_reason = StopReason::EndTurn;
        process_chunk(
            &json!({"choices": [], "usage": {"prompt_tokens": 10, "completion_tokens": 3}}),
            &mut started,
            &mut tool_calls,
            &mut usage,
            &mut stop_reason,
        );
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 3);
    }
}
