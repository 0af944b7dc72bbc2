//! Concrete [`ProviderAdapter`](crate::cloudllm::provider::ProviderAdapter) implementations
//! for the three wire formats named in §6: Anthropic-style SSE, OpenAI-compatible SSE, and
//! Ollama NDJSON. Each adapter owns a pooled [`reqwest::Client`] (via
//! [`crate::cloudllm::http_client_pool`]) and speaks the event-stream contract in
//! [`crate::cloudllm::provider`] directly; none retries internally, matching that contract.

pub mod anthropic;
pub mod ollama;
pub mod openai_compatible;

use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Splits a byte stream on `\n`, trimming a trailing `\r`, yielding complete lines (including
/// a final unterminated line once the stream ends) and dropping the remainder silently on a
/// transport error, since the caller surfaces its own terminal [`StreamEvent::Error`].
fn line_stream(bytes: ByteStream) -> Pin<Box<dyn Stream<Item = String> + Send>> {
    struct State {
        bytes: ByteStream,
        buf: String,
        done: bool,
    }
    Box::pin(stream::unfold(
        State { bytes, buf: String::new(), done: false },
        |mut state| async move {
            loop {
                if let Some(pos) = state.buf.find('\n') {
                    let line = state.buf[..pos].trim_end_matches('\r').to_string();
                    state.buf.drain(..=pos);
                    return Some((line, state));
                }
                if state.done {
                    if state.buf.is_empty() {
                        return None;
                    }
                    let line = std::mem::take(&mut state.buf);
                    return Some((line, state));
                }
                match state.bytes.next().await {
                    Some(Ok(chunk)) => state.buf.push_str(&String::from_utf8_lossy(&chunk)),
                    Some(Err(_)) | None => state.done = true,
                }
            }
        },
    ))
}

/// Parses a Server-Sent-Events byte stream into its `data:` JSON payloads, skipping the
/// `[DONE]` sentinel OpenAI-compatible servers emit and any non-JSON/blank/comment lines
/// (§6 "Anthropic SSE", "OpenAI-compatible SSE").
pub(super) fn sse_json_events(bytes: ByteStream) -> Pin<Box<dyn Stream<Item = Value> + Send>> {
    Box::pin(line_stream(bytes).filter_map(|line| async move {
        let payload = line.strip_prefix("data:")?.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return None;
        }
        serde_json::from_str::<Value>(payload).ok()
    }))
}

/// Parses a newline-delimited-JSON byte stream, one object per line (§6 "Ollama NDJSON").
pub(super) fn ndjson_events(bytes: ByteStream) -> Pin<Box<dyn Stream<Item = Value> + Send>> {
    Box::pin(line_stream(bytes).filter_map(|line| async move {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        serde_json::from_str::<Value>(trimmed).ok()
    }))
}

pub(super) fn response_byte_stream(response: reqwest::Response) -> ByteStream {
    Box::pin(response.bytes_stream())
}
