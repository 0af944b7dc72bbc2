//! The Marga routing pipeline: classify a turn, bind it to a provider/model, and stream the
//! result with escalation on failure (§4.5).
//!
//! `Pipeline::classify` runs the two classifiers from [`crate::cloudllm::classifier`], looks
//! the winning task type up in a [`BindingTable`] keyed by the active [`BindingProfile`],
//! applies complexity overrides and upgrade rules, and returns a [`PipelineDecision`].
//! `Pipeline::stream` drives that decision against the registered providers, walking a
//! weakest-to-strongest escalation chain when a provider call fails, grounded on
//! `orchestration.rs`'s fallback-across-providers loop but replacing its flat provider list
//! with a decision-driven, per-task-type chain.

use crate::cloudllm::cancellation::AbortSignal;
use crate::cloudllm::classifier::{classify_complexity, classify_task_type, Complexity, TaskType};
use crate::cloudllm::config::BindingProfile;
use crate::cloudllm::context::AgentContext;
use crate::cloudllm::error::PipelineError;
use crate::cloudllm::provider::{EventStream, ProviderRegistry, StopReason, StreamEvent, StreamOptions, Usage};
use crate::cloudllm::retry_stream::{RetryConfig, RetryableStream};
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;

/// The sentinel provider id meaning "no LLM call is needed for this task type" (§4.5 step 4).
pub const SKIP_LLM_PROVIDER: &str = "none";

/// One row of a binding table: which provider/model serves a task type, and why (§3).
#[derive(Debug, Clone)]
pub struct Binding {
    pub provider_id: String,
    pub model_id: String,
    pub rationale: String,
}

impl Binding {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            rationale: rationale.into(),
        }
    }

    fn skip(rationale: impl Into<String>) -> Self {
        Self::new(SKIP_LLM_PROVIDER, "", rationale)
    }
}

/// Maps every task type to exactly one binding (§4.5 "pre-defined profiles").
#[derive(Debug, Clone)]
pub struct BindingTable {
    rows: Vec<(TaskType, Binding)>,
}

impl BindingTable {
    pub fn get(&self, task_type: TaskType) -> &Binding {
        self.rows
            .iter()
            .find(|(t, _)| *t == task_type)
            .map(|(_, b)| b)
            .expect("binding table covers every TaskType variant")
    }

    /// The default profile bindings, grounded on the provider ids resolvable via
    /// [`crate::cloudllm::config::PROVIDER_ENV_VARS`]. Hand-authored per the three
    /// [`BindingProfile`] variants rather than derived, since the mapping is policy, not data.
    pub fn for_profile(profile: BindingProfile) -> Self {
        match profile {
            BindingProfile::Local => Self {
                rows: vec![
                    (TaskType::Heartbeat, Binding::skip("heartbeats never reach an LLM")),
                    (TaskType::Smalltalk, Binding::new("ollama", "llama3", "local model handles casual chat")),
                    (TaskType::Search, Binding::skip("search is tool-only, no LLM round trip")),
                    (TaskType::Memory, Binding::new("ollama", "llama3", "local model summarizes recall")),
                    (TaskType::FileOp, Binding::skip("file ops are tool-only")),
                    (TaskType::ApiCall, Binding::skip("api calls are tool-only")),
                    (TaskType::Compaction, Binding::new("ollama", "llama3", "local model compacts history")),
                    (TaskType::Embedding, Binding::skip("embedding is a vector op, not a chat turn")),
                    (TaskType::CodeGen, Binding::new("ollama", "codellama", "local code-tuned model")),
                    (TaskType::Chat, Binding::new("ollama", "llama3", "local model default chat")),
                    (TaskType::Summarize, Binding::new("ollama", "llama3", "local model summarizes")),
                    (TaskType::Translate, Binding::new("ollama", "llama3", "local model translates")),
                    (TaskType::ToolExec, Binding::new("ollama", "llama3", "local model drives tool use")),
                    (TaskType::Reasoning, Binding::new("ollama", "llama3", "local model reasons, escalated on complexity")),
                    (TaskType::Vision, Binding::new("ollama", "llava", "local vision model")),
                ],
            },
            BindingProfile::Cloud => Self {
                rows: vec![
                    (TaskType::Heartbeat, Binding::skip("heartbeats never reach an LLM")),
                    (TaskType::Smalltalk, Binding::new("anthropic", "claude-haiku", "cheap model for casual chat")),
                    (TaskType::Search, Binding::skip("search is tool-only, no LLM round trip")),
                    (TaskType::Memory, Binding::new("anthropic", "claude-haiku", "cheap model for recall summaries")),
                    (TaskType::FileOp, Binding::skip("file ops are tool-only")),
                    (TaskType::ApiCall, Binding::skip("api calls are tool-only")),
                    (TaskType::Compaction, Binding::new("anthropic", "claude-haiku", "cheap model compacts history")),
                    (TaskType::Embedding, Binding::skip("embedding is a vector op, not a chat turn")),
                    (TaskType::CodeGen, Binding::new("anthropic", "claude-sonnet", "code-capable mid-tier model")),
                    (TaskType::Chat, Binding::new("openai", "gpt-4o-mini", "default chat model")),
                    (TaskType::Summarize, Binding::new("anthropic", "claude-haiku", "cheap model summarizes")),
                    (TaskType::Translate, Binding::new("openai", "gpt-4o-mini", "default chat model translates")),
                    (TaskType::ToolExec, Binding::new("anthropic", "claude-sonnet", "mid-tier model drives tool use")),
                    (TaskType::Reasoning, Binding::new("anthropic", "claude-sonnet", "mid-tier reasoning, escalated on complexity")),
                    (TaskType::Vision, Binding::new("openai", "gpt-4o", "vision-capable model")),
                ],
            },
            BindingProfile::Hybrid => Self {
                rows: vec![
                    (TaskType::Heartbeat, Binding::skip("heartbeats never reach an LLM")),
                    (TaskType::Smalltalk, Binding::new("ollama", "llama3", "local model handles casual chat")),
                    (TaskType::Search, Binding::skip("search is tool-only, no LLM round trip")),
                    (TaskType::Memory, Binding::new("ollama", "llama3", "local model summarizes recall")),
                    (TaskType::FileOp, Binding::skip("file ops are tool-only")),
                    (TaskType::ApiCall, Binding::skip("api calls are tool-only")),
                    (TaskType::Compaction, Binding::new("ollama", "llama3", "local model compacts history")),
                    (TaskType::Embedding, Binding::skip("embedding is a vector op, not a chat turn")),
                    (TaskType::CodeGen, Binding::new("anthropic", "claude-sonnet", "cloud model for code correctness")),
                    (TaskType::Chat, Binding::new("ollama", "llama3", "local model default chat")),
                    (TaskType::Summarize, Binding::new("ollama", "llama3", "local model summarizes")),
                    (TaskType::Translate, Binding::new("ollama", "llama3", "local model translates")),
                    (TaskType::ToolExec, Binding::new("anthropic", "claude-sonnet", "cloud model drives tool use reliably")),
                    (TaskType::Reasoning, Binding::new("anthropic", "claude-sonnet", "cloud model reasons, escalated on complexity")),
                    (TaskType::Vision, Binding::new("openai", "gpt-4o", "vision needs a cloud model")),
                ],
            },
        }
    }
}

/// `minComplexityOverrides[taskType]` (§4.5 step 3): some task types can never be classified
/// below a given complexity floor regardless of what Vichara measured.
fn min_complexity_override(task_type: TaskType) -> Option<Complexity> {
    match task_type {
        TaskType::Reasoning => Some(Complexity::Complex),
        TaskType::Vision => Some(Complexity::Medium),
        TaskType::CodeGen => Some(Complexity::Medium),
        _ => None,
    }
}

/// One rung of the weakest→strongest escalation chain, keyed by binding profile (§4.5
/// "predefined escalation chain").
fn escalation_chain(profile: BindingProfile) -> Vec<(&'static str, &'static str)> {
    match profile {
        BindingProfile::Local => vec![("ollama", "llama3"), ("ollama", "codellama")],
        BindingProfile::Cloud | BindingProfile::Hybrid => vec![
            ("anthropic", "claude-haiku"),
            ("openai", "gpt-4o-mini"),
            ("anthropic", "claude-sonnet"),
            ("anthropic", "claude-opus"),
        ],
    }
}

/// Strongest binding per upgrade rule (§4.5 step 5), applied when effective complexity is at
/// least `complex`.
fn upgrade_binding(profile: BindingProfile, task_type: TaskType, complexity: Complexity) -> Option<Binding> {
    if complexity < Complexity::Complex {
        return None;
    }
    let strong = match profile {
        BindingProfile::Local => Binding::new("ollama", "codellama", "upgraded to strongest local model"),
        BindingProfile::Cloud | BindingProfile::Hybrid => {
            if complexity == Complexity::Expert {
                Binding::new("anthropic", "claude-opus", "expert complexity routed to strongest reasoning model")
            } else if matches!(task_type, TaskType::CodeGen | TaskType::ToolExec) {
                Binding::new("anthropic", "claude-sonnet", "complex code/tool-exec routed to code-optimized strong model")
            } else {
                Binding::new("anthropic", "claude-sonnet", "complex task routed to generic strong model")
            }
        }
    };
    Some(strong)
}

/// Resolved routing outcome for one prompt (§3).
///
/// `escalated_from` starts empty and is filled in by [`Pipeline::stream`] the first time the
/// escalation loop moves off the originally-decided provider, recording which provider the
/// request started on (§3 PipelineDecision "escalation source", §8 scenario S4). It is an
/// `Arc<Mutex<_>>` rather than a plain field because the decision is consumed by `stream`
/// before escalation is known to have happened; callers clone this handle before calling
/// `stream` if they want to observe it afterward.
#[derive(Debug, Clone)]
pub struct PipelineDecision {
    pub task_type: TaskType,
    pub complexity: Complexity,
    pub provider_id: String,
    pub model_id: String,
    pub rationale: String,
    pub confidence: f64,
    pub skip_llm: bool,
    pub temperature: f32,
    pub escalated_from: Arc<std::sync::Mutex<Option<String>>>,
}

/// Hook for adjusting the base temperature by task type and complexity (§4.5 step 6).
pub type TemperatureAdjust = Arc<dyn Fn(f32, TaskType, Complexity) -> f32 + Send + Sync>;

fn base_temperature(task_type: TaskType) -> f32 {
    match task_type {
        TaskType::CodeGen | TaskType::Reasoning | TaskType::Translate => 0.2,
        TaskType::Summarize | TaskType::Compaction | TaskType::Memory => 0.3,
        TaskType::Smalltalk | TaskType::Chat => 0.8,
        _ => 0.5,
    }
}

/// The Marga pipeline (§4.5). Owns the active profile, a provider registry to validate which
/// escalation rungs are actually available, and an optional temperature hook.
pub struct Pipeline {
    profile: BindingProfile,
    table: BindingTable,
    registry: Arc<ProviderRegistry>,
    temperature_adjust: Option<TemperatureAdjust>,
    max_escalations: u32,
}

impl Pipeline {
    pub fn new(profile: BindingProfile, registry: Arc<ProviderRegistry>) -> Self {
        let max_escalations = escalation_chain(profile).len() as u32;
        Self {
            profile,
            table: BindingTable::for_profile(profile),
            registry,
            temperature_adjust: None,
            max_escalations,
        }
    }

    pub fn with_temperature_adjust(mut self, hook: TemperatureAdjust) -> Self {
        self.temperature_adjust = Some(hook);
        self
    }

    /// Classify a context into a routing decision (§4.5 `Pipeline.classify`).
    pub fn classify(&self, context: &AgentContext, has_tools: bool) -> PipelineDecision {
        let task_result = classify_task_type(context, has_tools);
        let complexity_result = classify_complexity(context, has_tools);

        let mut complexity = complexity_result.label;
        if let Some(floor) = min_complexity_override(task_result.label) {
            complexity = complexity.max(floor);
        }

        let base_binding = self.table.get(task_result.label).clone();
        let skip_llm = base_binding.provider_id == SKIP_LLM_PROVIDER;

        let binding = if skip_llm {
            base_binding
        } else {
            upgrade_binding(self.profile, task_result.label, complexity).unwrap_or(base_binding)
        };

        let base_temp = base_temperature(task_result.label);
        let temperature = match &self.temperature_adjust {
            Some(hook) => hook(base_temp, task_result.label, complexity),
            None => base_temp,
        };

        // geometric mean of the two classifier confidences (§3 PipelineDecision).
        let confidence = (task_result.confidence * complexity_result.confidence).sqrt();

        PipelineDecision {
            task_type: task_result.label,
            complexity,
            provider_id: binding.provider_id,
            model_id: binding.model_id,
            rationale: binding.rationale,
            confidence,
            skip_llm,
            temperature,
            escalated_from: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Drive a decision against the registry with escalation (§4.5 `Pipeline.stream`).
    pub fn stream(&self, decision: PipelineDecision, context: AgentContext, options: StreamOptions) -> EventStream {
        if decision.skip_llm {
            return Box::pin(stream::iter(vec![StreamEvent::Done {
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
                cost: None,
            }]));
        }

        let chain = escalation_chain(self.profile);
        let registry = Arc::clone(&self.registry);
        let max_escalations = self.max_escalations;
        let escalated_from = Arc::clone(&decision.escalated_from);
        let original_provider_id = decision.provider_id.clone();

        let start_idx = chain
            .iter()
            .position(|(p, m)| *p == decision.provider_id && *m == decision.model_id)
            .unwrap_or(0);

        struct EscalationState {
            idx: usize,
            attempts: u32,
            inner: Option<EventStream>,
            last_error: Option<crate::cloudllm::error::TransportError>,
        }

        let initial = EscalationState {
            idx: start_idx,
            attempts: 0,
            inner: None,
            last_error: None,
        };

        Box::pin(stream::unfold(initial, move |mut state| {
            let registry = Arc::clone(&registry);
            let chain = chain.clone();
            let context = context.clone();
            let options = options.clone();
            async move {
                loop {
                    if state.inner.is_none() {
                        let Some((provider_id, model_id)) = chain.get(state.idx) else {
                            let cause = state.last_error.clone().unwrap_or_else(|| {
                                crate::cloudllm::error::TransportError {
                                    provider_id: "none".into(),
                                    status_code: None,
                                    message: "no escalation chain configured".into(),
                                    retryable: false,
                                    retry_after_ms: None,
                                }
                            });
                            log::error!("pipeline: providers exhausted after {} attempt(s)", state.attempts);
                            return Some((
                                StreamEvent::Error {
                                    error: crate::cloudllm::error::TransportError {
                                        provider_id: cause.provider_id.clone(),
                                        status_code: cause.status_code,
                                        message: format!("providers exhausted: {}", cause.message),
                                        retryable: false,
                                        retry_after_ms: None,
                                    },
                                },
                                state,
                            ));
                        };
                        let Some(adapter) = registry.get(provider_id) else {
                            log::warn!("pipeline: escalation rung {provider_id} not registered, skipping");
                            state.idx += 1;
                            continue;
                        };
                        let s = RetryableStream::stream(
                            adapter,
                            model_id.to_string(),
                            context.clone(),
                            options.clone(),
                            RetryConfig::default(),
                        );
                        state.inner = Some(s);
                    }

                    let next = state.inner.as_mut().unwrap().next().await;
                    match next {
                        None => return None,
                        Some(StreamEvent::Error { error }) => {
                            state.last_error = Some(error);
                            state.attempts += 1;
                            state.inner = None;
                            state.idx += 1;
                            {
                                let mut recorded = escalated_from.lock().unwrap();
                                if recorded.is_none() {
                                    *recorded = Some(original_provider_id.clone());
                                }
                            }
                            if state.attempts > max_escalations {
                                continue; // next loop iteration raises "providers exhausted"
                            }
                            log::warn!("pipeline: escalating to rung {}/{}", state.idx, chain.len());
                            continue;
                        }
                        Some(other) => return Some((other, state)),
                    }
                }
            }
        }))
    }
}

#[derive(Debug)]
pub struct ProvidersExhaustedError {
    pub decision: PipelineDecision,
    pub cause: PipelineError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::cancellation::AbortSignal;
    use crate::cloudllm::context::Message;
    use crate::cloudllm::provider::{ProviderAdapter, ProviderRegistry};
    use async_trait::async_trait;

    fn ctx_with(text: &str) -> AgentContext {
        let mut ctx = AgentContext::new();
        ctx.append(Message::user(text));
        ctx
    }

    #[test]
    fn heartbeat_skips_llm() {
        let pipeline = Pipeline::new(BindingProfile::Cloud, Arc::new(ProviderRegistry::new()));
        let decision = pipeline.classify(&ctx_with("ping"), false);
        assert!(decision.skip_llm);
        assert_eq!(decision.provider_id, SKIP_LLM_PROVIDER);
    }

    #[test]
    fn reasoning_has_complex_floor_regardless_of_length() {
        let pipeline = Pipeline::new(BindingProfile::Cloud, Arc::new(ProviderRegistry::new()));
        let decision = pipeline.classify(&ctx_with("why"), false);
        assert_eq!(decision.task_type, TaskType::Reasoning);
        assert!(decision.complexity >= Complexity::Complex);
    }

    #[test]
    fn expert_complexity_routes_to_strongest_model() {
        let pipeline = Pipeline::new(BindingProfile::Cloud, Arc::new(ProviderRegistry::new()));
        let decision = pipeline.classify(
            &ctx_with("design a consensus protocol for a distributed systems cluster with formal proof of safety"),
            false,
        );
        assert_eq!(decision.model_id, "claude-opus");
    }

    #[tokio::test]
    async fn stream_skip_llm_yields_synthetic_done() {
        let pipeline = Pipeline::new(BindingProfile::Cloud, Arc::new(ProviderRegistry::new()));
        let decision = pipeline.classify(&ctx_with("ping"), false);
        let mut s = pipeline.stream(decision, AgentContext::new(), StreamOptions::new(AbortSignal::never()));
        let event = s.next().await;
        assert!(matches!(event, Some(StreamEvent::Done { .. })));
    }

    struct FailingAdapter {
        id: String,
    }

    #[async_trait]
    impl ProviderAdapter for FailingAdapter {
        fn id(&self) -> &str {
            &self.id
        }
        fn name(&self) -> &str {
            &self.id
        }
        fn models(&self) -> &[String] {
            &[]
        }
        async fn stream(&self, _model_id: &str, _context: &AgentContext, _options: StreamOptions) -> EventStream {
            Box::pin(stream::iter(vec![StreamEvent::Error {
                error: crate::cloudllm::error::TransportError {
                    provider_id: self.id.clone(),
                    status_code: Some(500),
                    message: "down".into(),
                    retryable: false,
                    retry_after_ms: None,
                },
            }]))
        }
    }

    #[tokio::test]
    async fn stream_escalates_past_unavailable_providers() {
        let registry = Arc::new(ProviderRegistry::new());
        registry.register(Arc::new(FailingAdapter { id: "anthropic".into() }));
        registry.register(Arc::new(FailingAdapter { id: "openai".into() }));
        let pipeline = Pipeline::new(BindingProfile::Cloud, registry);
        let decision = pipeline.classify(&ctx_with("please write code to implement a function"), false);
        let mut s = pipeline.stream(decision, AgentContext::new(), StreamOptions::new(AbortSignal::never()));
        let mut last = None;
        while let Some(e) = s.next().await {
            last = Some(e);
        }
        assert!(matches!(last, Some(StreamEvent::Error { .. })));
    }
}
