//! The `ProviderAdapter` contract (§4.1) and the process-wide provider registry (§9).
//!
//! A provider is a black box: given a model id, a context, and streaming options, it
//! produces a finite lazy sequence of [`StreamEvent`]s. Concrete adapters (Anthropic SSE,
//! OpenAI-compatible SSE, Ollama NDJSON) live under [`crate::cloudllm::providers`]; this
//! module only defines the shape every adapter must satisfy: a tagged-union event stream so
//! tool calls, thinking, and usage all travel through the same channel rather than a bare
//! text-delta stream.

use crate::cloudllm::cancellation::AbortSignal;
use crate::cloudllm::context::AgentContext;
use crate::cloudllm::error::TransportError;
use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde_json::Value;
use futures_util::stream::Stream;
use std::pin::Pin;
use std::sync::Arc;

/// One element of the lazy sequence a [`ProviderAdapter`] produces (§4.1).
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Start { message_id: String },
    Text { text: String },
    Thinking { text: String },
    /// Arguments are delivered whole — adapters accumulate incremental JSON deltas
    /// (`input_json_delta.partial_json`, OpenAI's by-index `tool_calls` assembly) internally
    /// and only emit this once the full call is known.
    ToolCall { id: String, name: String, arguments: Value },
    /// Only emitted by providers that surface their own tool execution (none of the
    /// prebuilt adapters do; reserved for future server-side-tool providers).
    ToolResult { tool_call_id: String, content: String, is_error: bool },
    /// May appear multiple times; `Done::usage` is the final authoritative figure.
    Usage { input_tokens: u64, output_tokens: u64, cache_read_tokens: Option<u64> },
    Error { error: TransportError },
    Done { stop_reason: StopReason, usage: Usage, cost: Option<f64> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    StopSequence,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: Option<u64>,
}

/// Per-call streaming knobs.
#[derive(Clone)]
pub struct StreamOptions {
    pub tools: Vec<crate::cloudllm::tool_handler::ToolDefinition>,
    pub temperature: f32,
    pub max_tokens: Option<u64>,
    pub signal: AbortSignal,
}

impl StreamOptions {
    pub fn new(signal: AbortSignal) -> Self {
        Self {
            tools: Vec::new(),
            temperature: 0.7,
            max_tokens: None,
            signal,
        }
    }

    pub fn with_tools(mut self, tools: Vec<crate::cloudllm::tool_handler::ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Contract every provider implementation satisfies (§4.1, §6).
///
/// No adapter may retry internally — retry is [`crate::cloudllm::retry_stream::RetryableStream`]'s
/// responsibility. Implementations must be `Send + Sync` so a single registered adapter can
/// be shared across concurrently running sibling agents.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable identifier, e.g. `"anthropic"`, `"openai"`, `"ollama"`.
    fn id(&self) -> &str;

    /// Human-readable display name.
    fn name(&self) -> &str;

    /// Model ids this adapter can serve.
    fn models(&self) -> &[String];

    /// Produce the event stream for one turn. The sequence MUST begin with exactly one
    /// `Start` and end with exactly one `Done`, unless it ends with `Error` due to a
    /// transport failure partway through.
    async fn stream(&self, model_id: &str, context: &AgentContext, options: StreamOptions) -> EventStream;

    /// Optionally validate a configured key without issuing a full request.
    async fn validate_key(&self, _key: &str) -> bool {
        true
    }
}

/// Process-wide, immutable-after-startup registry of providers (§9 "Global mutable state").
/// Populated once during process init; adapters whose credentials are absent from the
/// environment are simply never inserted (§6: "Missing keys cause the corresponding adapter
/// to be absent from the registry, not to fail").
pub struct ProviderRegistry {
    adapters: DashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            adapters: DashMap::new(),
        }
    }

    pub fn register(&self, adapter: Arc<dyn ProviderAdapter>) {
        let id = adapter.id().to_string();
        log::info!("registering provider adapter: {id}");
        self.adapters.insert(id, adapter);
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider_id).map(|r| r.clone())
    }

    pub fn is_registered(&self, provider_id: &str) -> bool {
        self.adapters.contains_key(provider_id)
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.adapters.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The single process-wide registry singleton, grounded on `http_client_pool.rs`'s
/// `static CLIENT_POOL: Lazy<DashMap<...>>` pattern.
pub static GLOBAL_PROVIDER_REGISTRY: Lazy<ProviderRegistry> = Lazy::new(ProviderRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::context::AgentContext;
    use futures_util::stream::{self, StreamExt};

    struct FakeAdapter {
        id: String,
        models: Vec<String>,
    }

    #[async_trait]
    impl ProviderAdapter for FakeAdapter {
        fn id(&self) -> &str {
            &self.id
        }
        fn name(&self) -> &str {
            &self.id
        }
        fn models(&self) -> &[String] {
            &self.models
        }
        async fn stream(&self, _model_id: &str, _context: &AgentContext, _options: StreamOptions) -> EventStream {
            Box::pin(stream::iter(vec![
                StreamEvent::Start { message_id: "m1".into() },
                StreamEvent::Done {
                    stop_reason: StopReason::EndTurn,
                    usage: Usage::default(),
                    cost: None,
                },
            ]))
        }
    }

    #[tokio::test]
    async fn registry_round_trips_adapter() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(FakeAdapter {
            id: "fake".into(),
            models: vec!["fake-model".into()],
        }));
        assert!(registry.is_registered("fake"));
        let adapter = registry.get("fake").unwrap();
        let mut stream = adapter
            .stream(
                "fake-model",
                &AgentContext::new(),
                StreamOptions::new(crate::cloudllm::cancellation::AbortSignal::never()),
            )
            .await;
        let first = stream.next().await;
        assert!(matches!(first, Some(StreamEvent::Start { .. })));
    }

    #[test]
    fn missing_provider_is_absent_not_error() {
        let registry = ProviderRegistry::new();
        assert!(registry.get("nonexistent").is_none());
    }
}
