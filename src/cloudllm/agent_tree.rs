//! The supervised agent tree: node lifecycle, event fan-out, the multi-turn tool loop, and
//! tree operations (§3 Agent, §4.6, §4.7).
//!
//! Generalizes `agent.rs`'s flat, JSON-regex tool-calling `Agent` into a tree-structured node
//! whose prompt loop instead consumes the tagged [`StreamEvent`] union produced by
//! [`crate::cloudllm::provider`] and [`crate::cloudllm::pipeline`]. The builder-style
//! `with_*` construction and `emit`/`emit_sync` event fan-out are kept from `agent.rs`; the
//! tool-call parsing and flat-session state are replaced entirely.

use crate::cloudllm::cancellation::{AbortController, AbortSignal};
use crate::cloudllm::config::ResourceCeilings;
use crate::cloudllm::context::{AgentContext, ContentPart, Message};
use crate::cloudllm::error::{AgentError, ConfigError};
use crate::cloudllm::event::{AgentEvent, EventHandler, NullEventHandler};
use crate::cloudllm::pipeline::Pipeline;
use crate::cloudllm::provider::{ProviderRegistry, StopReason, StreamEvent, StreamOptions};
use crate::cloudllm::retry_stream::{RetryConfig, RetryableStream};
use crate::cloudllm::tool_handler::{AllowAllPolicy, PolicyEngine, ToolHandler, ToolRegistry};
use futures_util::stream::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

/// A prompt loop restarts after each tool-dispatch round; this caps rounds against a
/// misbehaving provider that never stops requesting tools, grounded on `agent.rs`'s own
/// `max_tool_iterations` safety cap (there fixed at 5; widened here since tool-exec tasks are
/// expected to chain more steps).
const MAX_TOOL_ITERATIONS: u32 = 25;

/// Lifecycle status of an [`Agent`] (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Idle,
    Running,
    Completed,
    Aborted,
    Error,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Running => "running",
            AgentStatus::Completed => "completed",
            AgentStatus::Aborted => "aborted",
            AgentStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// An explicit provider/model override bypassing the Marga pipeline (§4.6: "Build a streaming
/// call to the bound provider (or Pipeline)").
#[derive(Debug, Clone)]
pub struct ProviderBinding {
    pub provider_id: String,
    pub model_id: String,
    pub temperature: f32,
}

/// Configuration for [`Agent::spawn`] (§4.7). Anything left `None`/empty is inherited from the
/// spawning parent.
pub struct SpawnConfig {
    pub purpose: String,
    pub provider_binding: Option<ProviderBinding>,
    pub tools: Vec<Arc<dyn ToolHandler>>,
    pub policy: Option<Arc<dyn PolicyEngine>>,
    pub event_handler: Option<Arc<dyn EventHandler>>,
    pub bubble_events: bool,
}

impl SpawnConfig {
    pub fn new(purpose: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            provider_binding: None,
            tools: Vec::new(),
            policy: None,
            event_handler: None,
            bubble_events: true,
        }
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>, model_id: impl Into<String>, temperature: f32) -> Self {
        self.provider_binding = Some(ProviderBinding {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            temperature,
        });
        self
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn ToolHandler>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn without_bubbling(mut self) -> Self {
        self.bubble_events = false;
        self
    }
}

/// Outcome of `parent.delegate(...)` (§4.7): spawn + prompt in one call, captured rather than
/// propagated as an error so a batch of delegations can report partial failure.
#[derive(Debug, Clone)]
pub struct SubAgentResult {
    pub agent_id: String,
    pub purpose: String,
    pub status: SubAgentOutcome,
    pub response: Option<String>,
    pub messages: Vec<Message>,
    pub cost: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAgentOutcome {
    Completed,
    Error,
}

/// Serializable snapshot of a subtree, returned by [`Agent::get_tree`] (§4.7).
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub id: String,
    pub purpose: String,
    pub depth: u32,
    pub status: AgentStatus,
    pub children: Vec<AgentSnapshot>,
}

#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    pub root: AgentSnapshot,
    pub total_agents: usize,
    pub max_depth: u32,
}

/// A node in the supervised agent tree (§3).
///
/// Children are owned (their lifetime is bound to the parent's); the back-reference to the
/// parent is a [`Weak`] so dropping a subtree's last strong reference tears it down without a
/// reference cycle, matching the ownership summary in §3.
pub struct Agent {
    id: String,
    purpose: String,
    depth: u32,
    parent: Weak<Agent>,
    children: RwLock<Vec<Arc<Agent>>>,
    status: RwLock<AgentStatus>,
    context: RwLock<AgentContext>,
    tools: RwLock<ToolRegistry>,
    policy: Arc<dyn PolicyEngine>,
    provider_binding: RwLock<Option<ProviderBinding>>,
    pipeline: Option<Arc<Pipeline>>,
    registry: Arc<ProviderRegistry>,
    event_handler: Arc<dyn EventHandler>,
    bubble_events: bool,
    abort_controller: RwLock<Option<AbortController>>,
    ceilings: ResourceCeilings,
}

impl Agent {
    /// Construct the root of a new tree (§3: "created by spawn/root constructor").
    pub fn root(
        purpose: impl Into<String>,
        pipeline: Option<Arc<Pipeline>>,
        registry: Arc<ProviderRegistry>,
        ceilings: ResourceCeilings,
    ) -> Arc<Self> {
        Self::root_with_event_handler(purpose, pipeline, registry, ceilings, Arc::new(NullEventHandler))
    }

    pub fn root_with_event_handler(
        purpose: impl Into<String>,
        pipeline: Option<Arc<Pipeline>>,
        registry: Arc<ProviderRegistry>,
        ceilings: ResourceCeilings,
        event_handler: Arc<dyn EventHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            purpose: purpose.into(),
            depth: 0,
            parent: Weak::new(),
            children: RwLock::new(Vec::new()),
            status: RwLock::new(AgentStatus::Idle),
            context: RwLock::new(AgentContext::new()),
            tools: RwLock::new(ToolRegistry::new()),
            policy: Arc::new(AllowAllPolicy),
            provider_binding: RwLock::new(None),
            pipeline,
            registry,
            event_handler,
            bubble_events: true,
            abort_controller: RwLock::new(None),
            ceilings,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub async fn status(&self) -> AgentStatus {
        *self.status.read().await
    }

    pub async fn context(&self) -> AgentContext {
        self.context.read().await.clone()
    }

    pub async fn set_provider(&self, provider_id: impl Into<String>, model_id: impl Into<String>, temperature: f32) {
        *self.provider_binding.write().await = Some(ProviderBinding {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            temperature,
        });
    }

    pub async fn register_tool(&self, handler: Arc<dyn ToolHandler>) -> Result<(), crate::cloudllm::tool_handler::DuplicateToolError> {
        self.tools.write().await.register(handler)
    }

    pub async fn unregister_tool(&self, name: &str) -> bool {
        self.tools.write().await.unregister(name)
    }

    // ---- event fan-out (§4.6) ----

    /// Emit `event` to this agent's own handler, then bubble it one hop up to the parent
    /// (wrapped in [`AgentEvent::SubagentEvent`]) unless bubbling is disabled for this agent.
    fn emit<'a>(&'a self, event: AgentEvent) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.event_handler.on_agent_event(&self.id, &event).await;
            if self.bubble_events {
                if let Some(parent) = self.parent.upgrade() {
                    let wrapped = event.bubble(self.id.clone(), self.purpose.clone(), self.depth);
                    parent.emit(wrapped).await;
                }
            }
        })
    }

    // ---- spawn / delegate (§4.7) ----

    /// Create a child agent, inheriting provider binding, tools, policy, and pipeline unless
    /// `config` overrides them (§4.7).
    pub async fn spawn(self: &Arc<Self>, config: SpawnConfig) -> Result<Arc<Agent>, ConfigError> {
        let child_depth = self.depth + 1;
        if child_depth > self.ceilings.max_agent_depth {
            return Err(ConfigError::DepthExceeded {
                attempted: child_depth,
                max: self.ceilings.max_agent_depth,
            });
        }
        {
            let children = self.children.read().await;
            if children.len() as u32 >= self.ceilings.max_sub_agents {
                return Err(ConfigError::TooManySubAgents {
                    parent_id: self.id.clone(),
                    max: self.ceilings.max_sub_agents,
                });
            }
        }

        let inherited_binding = self.provider_binding.read().await.clone();
        let provider_binding = config.provider_binding.or(inherited_binding);

        let mut tool_registry = ToolRegistry::new();
        let inherited_defs_source = self.tools.read().await;
        let tools_to_register: Vec<Arc<dyn ToolHandler>> = if config.tools.is_empty() {
            inherited_defs_source
                .definitions()
                .iter()
                .filter_map(|d| inherited_defs_source.get(&d.name))
                .collect()
        } else {
            config.tools
        };
        drop(inherited_defs_source);
        for handler in tools_to_register {
            let _ = tool_registry.register(handler);
        }

        let child = Arc::new(Agent {
            id: uuid::Uuid::new_v4().to_string(),
            purpose: config.purpose,
            depth: child_depth,
            parent: Arc::downgrade(self),
            children: RwLock::new(Vec::new()),
            status: RwLock::new(AgentStatus::Idle),
            context: RwLock::new(AgentContext::new()),
            tools: RwLock::new(tool_registry),
            policy: config.policy.unwrap_or_else(|| self.policy.clone()),
            provider_binding: RwLock::new(provider_binding),
            pipeline: self.pipeline.clone(),
            registry: Arc::clone(&self.registry),
            event_handler: config.event_handler.unwrap_or_else(|| self.event_handler.clone()),
            bubble_events: config.bubble_events,
            abort_controller: RwLock::new(None),
            ceilings: self.ceilings.clone(),
        });

        self.children.write().await.push(Arc::clone(&child));
        log::info!("agent {} spawned child {} ({})", self.id, child.id, child.purpose);
        self.emit(AgentEvent::SubagentSpawn {
            child_id: child.id.clone(),
            purpose: child.purpose.clone(),
        })
        .await;

        Ok(child)
    }

    /// Spawn + prompt in one call, capturing the result rather than propagating errors
    /// (§4.7).
    pub async fn delegate(self: &Arc<Self>, config: SpawnConfig, prompt_text: &str) -> Result<SubAgentResult, ConfigError> {
        let child = self.spawn(config).await?;
        let agent_id = child.id.clone();
        let purpose = child.purpose.clone();
        match child.prompt(prompt_text).await {
            Ok(message) => Ok(SubAgentResult {
                agent_id,
                purpose,
                status: SubAgentOutcome::Completed,
                response: Some(message.text_only()),
                messages: child.context().await.messages().to_vec(),
                cost: None,
                error: None,
            }),
            Err(err) => Ok(SubAgentResult {
                agent_id,
                purpose,
                status: SubAgentOutcome::Error,
                response: None,
                messages: child.context().await.messages().to_vec(),
                cost: None,
                error: Some(err.to_string()),
            }),
        }
    }

    /// Validate the combined child count up-front, then spawn and prompt every task
    /// concurrently, returning results in input order (§4.7).
    pub async fn delegate_parallel(
        self: &Arc<Self>,
        tasks: Vec<(SpawnConfig, String)>,
    ) -> Result<Vec<SubAgentResult>, ConfigError> {
        {
            let children = self.children.read().await;
            if children.len() as u32 + tasks.len() as u32 > self.ceilings.max_sub_agents {
                return Err(ConfigError::TooManySubAgents {
                    parent_id: self.id.clone(),
                    max: self.ceilings.max_sub_agents,
                });
            }
        }
        let futures = tasks.into_iter().map(|(config, text)| {
            let this = Arc::clone(self);
            async move { this.delegate(config, &text).await }
        });
        let results = futures_util::future::join_all(futures).await;
        results.into_iter().collect()
    }

    // ---- traversal (§4.7, all O(n) in subtree size) ----

    pub async fn get_root(self: &Arc<Self>) -> Arc<Agent> {
        let mut current = Arc::clone(self);
        while let Some(parent) = current.parent.upgrade() {
            current = parent;
        }
        current
    }

    /// Parent-first, self excluded.
    pub async fn get_ancestors(self: &Arc<Self>) -> Vec<Arc<Agent>> {
        let mut result = Vec::new();
        let mut current = self.parent.upgrade();
        while let Some(node) = current {
            current = node.parent.upgrade();
            result.push(node);
        }
        result
    }

    /// Root-first, including self.
    pub async fn get_lineage(self: &Arc<Self>) -> Vec<Arc<Agent>> {
        let mut ancestors = self.get_ancestors().await;
        ancestors.reverse();
        ancestors.push(Arc::clone(self));
        ancestors
    }

    /// Self excluded, BFS order.
    pub async fn get_descendants(self: &Arc<Self>) -> Vec<Arc<Agent>> {
        let mut result = Vec::new();
        let mut queue: VecDeque<Arc<Agent>> = self.children.read().await.clone().into();
        while let Some(node) = queue.pop_front() {
            let kids = node.children.read().await.clone();
            queue.extend(kids);
            result.push(node);
        }
        result
    }

    pub async fn get_siblings(self: &Arc<Self>) -> Vec<Arc<Agent>> {
        match self.parent.upgrade() {
            Some(parent) => parent
                .children
                .read()
                .await
                .iter()
                .filter(|c| c.id != self.id)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Subtree search rooted at `self` (inclusive).
    pub async fn find_agent(self: &Arc<Self>, id: &str) -> Option<Arc<Agent>> {
        if self.id == id {
            return Some(Arc::clone(self));
        }
        for descendant in self.get_descendants().await {
            if descendant.id == id {
                return Some(descendant);
            }
        }
        None
    }

    pub async fn is_ancestor_of(self: &Arc<Self>, id: &str) -> bool {
        self.get_descendants().await.iter().any(|d| d.id == id)
    }

    pub async fn is_descendant_of(self: &Arc<Self>, id: &str) -> bool {
        self.get_ancestors().await.iter().any(|a| a.id == id)
    }

    fn snapshot<'a>(node: &'a Arc<Agent>) -> Pin<Box<dyn Future<Output = AgentSnapshot> + Send + 'a>> {
        Box::pin(async move {
            let status = node.status().await;
            let children_arcs = node.children.read().await.clone();
            let mut children = Vec::with_capacity(children_arcs.len());
            for child in &children_arcs {
                children.push(Agent::snapshot(child).await);
            }
            AgentSnapshot {
                id: node.id.clone(),
                purpose: node.purpose.clone(),
                depth: node.depth,
                status,
                children,
            }
        })
    }

    /// Serializable snapshot of the subtree rooted at `self` (§4.7).
    pub async fn get_tree(self: &Arc<Self>) -> TreeSnapshot {
        let root = Agent::snapshot(self).await;
        let descendants = self.get_descendants().await;
        let total_agents = 1 + descendants.len();
        let max_depth = descendants.iter().map(|d| d.depth).max().unwrap_or(self.depth);
        TreeSnapshot {
            root,
            total_agents,
            max_depth,
        }
    }

    fn render_node(node: &AgentSnapshot, prefix: &str, out: &mut String) {
        out.push_str(&format!("{prefix}{} [{}] ({})\n", node.purpose, node.status, node.id));
        for (i, child) in node.children.iter().enumerate() {
            let last = i == node.children.len() - 1;
            let branch = if last { "  `- " } else { "  |- " };
            Agent::render_node(child, &format!("{prefix}{branch}"), out);
        }
    }

    /// ASCII rendering of this subtree (§4.7).
    pub async fn render_tree(self: &Arc<Self>) -> String {
        let snapshot = self.get_tree().await;
        let mut out = String::new();
        Agent::render_node(&snapshot.root, "", &mut out);
        out
    }

    /// Human-readable `root > ... > self` purpose chain (§4.7).
    pub async fn get_lineage_path(self: &Arc<Self>) -> String {
        self.get_lineage()
            .await
            .iter()
            .map(|a| a.purpose.clone())
            .collect::<Vec<_>>()
            .join(" > ")
    }

    // ---- removal (§4.7) ----

    /// Remove a child iff its status is not `running`.
    pub async fn remove_child(&self, id: &str) -> bool {
        let mut children = self.children.write().await;
        let Some(pos) = children.iter().position(|c| c.id == id) else {
            return false;
        };
        if *children[pos].status.read().await == AgentStatus::Running {
            return false;
        }
        children.remove(pos);
        true
    }

    /// Remove every child whose status is not `running`; returns the count removed.
    pub async fn prune_children(&self) -> usize {
        let mut children = self.children.write().await;
        let mut keep = Vec::with_capacity(children.len());
        let mut removed = 0;
        for child in children.drain(..) {
            if *child.status.read().await == AgentStatus::Running {
                keep.push(child);
            } else {
                removed += 1;
            }
        }
        *children = keep;
        removed
    }

    // ---- abort cascade (§4.7, §5) ----

    /// Abort this agent's in-flight prompt if any, then recursively abort every child.
    /// Children that were never started stay idle; children that were running transition to
    /// aborted.
    pub fn abort<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if let Some(controller) = self.abort_controller.write().await.take() {
                controller.abort();
            }
            {
                let mut status = self.status.write().await;
                if *status == AgentStatus::Running {
                    *status = AgentStatus::Aborted;
                }
            }
            let children = self.children.read().await.clone();
            for child in children {
                child.abort().await;
            }
            self.emit(AgentEvent::Abort).await;
        })
    }

    // ---- tool dispatch (§4.6) ----

    async fn dispatch_tool(&self, name: &str, args: Value, signal: &AbortSignal) -> (String, bool) {
        match self.policy.check(name, &args).await {
            decision if !decision.allowed => {
                let reason = decision.reason.unwrap_or_else(|| "denied".to_string());
                (format!("Policy denied: {reason}"), true)
            }
            _ => {
                let handler = self.tools.read().await.get(name);
                match handler {
                    None => (format!("Unknown tool {name}"), true),
                    Some(handler) => match handler.execute(args, signal).await {
                        Ok(result) => (result.content, result.is_error),
                        Err(e) => (e.to_string(), true),
                    },
                }
            }
        }
    }

    // ---- prompt loop (§4.6 ToolExecutor) ----

    /// Run one multi-turn prompt to completion (§4.6). Fails with [`AgentError::Conflict`] if
    /// not idle/completed, with [`AgentError::Config`] if no provider is bound, and with
    /// [`AgentError::Aborted`] if the signal fires before a terminal state is reached.
    pub async fn prompt(&self, user_text: &str) -> Result<Message, AgentError> {
        {
            let status = *self.status.read().await;
            if status != AgentStatus::Idle && status != AgentStatus::Completed {
                return Err(AgentError::Conflict {
                    agent_id: self.id.clone(),
                    status: status.to_string(),
                });
            }
        }

        let binding = self.provider_binding.read().await.clone();
        if binding.is_none() && self.pipeline.is_none() {
            return Err(AgentError::Config(ConfigError::NoProviderBound {
                agent_id: self.id.clone(),
            }));
        }

        self.context.write().await.append(Message::user(user_text));
        *self.status.write().await = AgentStatus::Running;
        let controller = AbortController::new();
        let signal = controller.signal();
        *self.abort_controller.write().await = Some(controller);

        self.emit(AgentEvent::Start {
            message_id: uuid::Uuid::new_v4().to_string(),
        })
        .await;

        let has_tools = !self.tools.read().await.is_empty();
        let tool_defs = self.tools.read().await.definitions();

        let mut iterations = 0u32;
        let result = loop {
            if signal.is_aborted() {
                break Err(AgentError::Aborted { agent_id: self.id.clone() });
            }
            if iterations >= MAX_TOOL_ITERATIONS {
                break Err(AgentError::Pipeline(crate::cloudllm::error::PipelineError {
                    attempted_providers: Vec::new(),
                    cause: crate::cloudllm::error::TransportError {
                        provider_id: "none".into(),
                        status_code: None,
                        message: "max tool iterations exceeded".into(),
                        retryable: false,
                        retry_after_ms: None,
                    },
                }));
            }
            iterations += 1;

            let context_snapshot = self.context.read().await.clone();
            let options = StreamOptions::new(signal.clone())
                .with_tools(tool_defs.clone())
                .with_temperature(binding.as_ref().map(|b| b.temperature).unwrap_or(0.7));

            let mut stream = match &binding {
                Some(b) => match self.registry.get(&b.provider_id) {
                    Some(adapter) => RetryableStream::stream(
                        adapter,
                        b.model_id.clone(),
                        context_snapshot,
                        options,
                        RetryConfig::default(),
                    ),
                    None => {
                        break Err(AgentError::Config(ConfigError::NoProviderBound {
                            agent_id: self.id.clone(),
                        }))
                    }
                },
                None => {
                    let pipeline = self.pipeline.as_ref().unwrap();
                    let decision = pipeline.classify(&context_snapshot, has_tools);
                    pipeline.stream(decision, context_snapshot, options)
                }
            };

            let mut text_buf = String::new();
            let mut thinking_buf = String::new();
            let mut tool_calls: Vec<(String, String, Value)> = Vec::new();
            let mut terminal: Option<Result<Message, AgentError>> = None;

            while let Some(event) = stream.next().await {
                match event {
                    StreamEvent::Start { message_id } => {
                        self.emit(AgentEvent::Start { message_id }).await;
                    }
                    StreamEvent::Text { text } => {
                        text_buf.push_str(&text);
                        self.emit(AgentEvent::Text { text }).await;
                    }
                    StreamEvent::Thinking { text } => {
                        thinking_buf.push_str(&text);
                        self.emit(AgentEvent::Thinking { text }).await;
                    }
                    StreamEvent::ToolCall { id, name, arguments } => {
                        self.emit(AgentEvent::ToolCall {
                            id: id.clone(),
                            name: name.clone(),
                            arguments: arguments.clone(),
                        })
                        .await;
                        tool_calls.push((id, name, arguments));
                    }
                    StreamEvent::ToolResult { tool_call_id, content, is_error } => {
                        self.emit(AgentEvent::ToolResult {
                            tool_call_id,
                            content,
                            is_error,
                        })
                        .await;
                    }
                    StreamEvent::Usage { input_tokens, output_tokens, cache_read_tokens } => {
                        self.emit(AgentEvent::Usage {
                            input_tokens,
                            output_tokens,
                            cache_read_tokens,
                        })
                        .await;
                    }
                    StreamEvent::Error { error } => {
                        log::error!("agent {} prompt loop terminal error: {error}", self.id);
                        self.emit(AgentEvent::Error { message: error.to_string() }).await;
                        terminal = Some(Err(AgentError::Pipeline(crate::cloudllm::error::PipelineError {
                            attempted_providers: Vec::new(),
                            cause: error,
                        })));
                        break;
                    }
                    StreamEvent::Done { stop_reason, .. } => {
                        self.emit(AgentEvent::Done {
                            stop_reason: format!("{stop_reason:?}"),
                        })
                        .await;

                        let mut parts = Vec::new();
                        if !text_buf.is_empty() {
                            parts.push(ContentPart::text(text_buf.clone()));
                        }
                        if !thinking_buf.is_empty() {
                            parts.push(ContentPart::thinking(thinking_buf.clone()));
                        }
                        for (id, name, arguments) in &tool_calls {
                            parts.push(ContentPart::tool_call(id.clone(), name.clone(), arguments.clone()));
                        }
                        let assistant_message = Message::assistant(parts);
                        self.context.write().await.append(assistant_message.clone());

                        if stop_reason == StopReason::ToolUse && !tool_calls.is_empty() {
                            let mut result_parts = Vec::new();
                            for (id, name, arguments) in &tool_calls {
                                if signal.is_aborted() {
                                    break;
                                }
                                let (content, is_error) = self.dispatch_tool(name, arguments.clone(), &signal).await;
                                result_parts.push(ContentPart::tool_result(id.clone(), content, is_error));
                            }
                            self.context.write().await.append(Message::tool_result(result_parts));
                            terminal = None; // continue outer loop
                        } else {
                            *self.status.write().await = AgentStatus::Completed;
                            terminal = Some(Ok(assistant_message));
                        }
                        break;
                    }
                }
            }

            match terminal {
                Some(outcome) => break outcome,
                None => continue,
            }
        };

        if result.is_err() && !matches!(result, Err(AgentError::Conflict { .. })) {
            let mut status = self.status.write().await;
            if *status != AgentStatus::Aborted {
                *status = AgentStatus::Error;
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::provider::{ProviderAdapter, EventStream, StopReason as SR, Usage};
    use async_trait::async_trait;
    use futures_util::stream;
    use std::error::Error;

    struct StubAdapter;

    #[async_trait]
    impl ProviderAdapter for StubAdapter {
        fn id(&self) -> &str {
            "stub"
        }
        fn name(&self) -> &str {
            "stub"
        }
        fn models(&self) -> &[String] {
            &[]
        }
        async fn stream(&self, _model_id: &str, _context: &AgentContext, _options: StreamOptions) -> EventStream {
            Box::pin(stream::iter(vec![
                StreamEvent::Start { message_id: "m1".into() },
                StreamEvent::Text { text: "hello".into() },
                StreamEvent::Done {
                    stop_reason: SR::EndTurn,
                    usage: Usage::default(),
                    cost: None,
                },
            ]))
        }
    }

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn definition(&self) -> crate::cloudllm::tool_handler::ToolDefinition {
            crate::cloudllm::tool_handler::ToolDefinition::new("echo", "echoes", serde_json::json!({"type":"object"}))
        }
        async fn execute(&self, args: Value, _signal: &AbortSignal) -> Result<crate::cloudllm::tool_handler::ToolExecutionResult, Box<dyn Error + Send + Sync>> {
            Ok(crate::cloudllm::tool_handler::ToolExecutionResult::ok(args.to_string()))
        }
    }

    fn ceilings() -> ResourceCeilings {
        ResourceCeilings::default()
    }

    #[tokio::test]
    async fn prompt_without_provider_fails_misconfiguration() {
        let agent = Agent::root("root", None, Arc::new(ProviderRegistry::new()), ceilings());
        let err = agent.prompt("hi").await.unwrap_err();
        assert!(matches!(err, AgentError::Config(ConfigError::NoProviderBound { .. })));
    }

    #[tokio::test]
    async fn prompt_with_explicit_binding_completes() {
        let registry = Arc::new(ProviderRegistry::new());
        registry.register(Arc::new(StubAdapter));
        let agent = Agent::root("root", None, Arc::clone(&registry), ceilings());
        agent.set_provider("stub", "stub-model", 0.5).await;
        let message = agent.prompt("hi").await.unwrap();
        assert_eq!(message.text_only(), "hello");
        assert_eq!(agent.status().await, AgentStatus::Completed);
    }

    #[tokio::test]
    async fn spawn_enforces_depth_ceiling() {
        let registry = Arc::new(ProviderRegistry::new());
        let mut c = ceilings();
        c.max_agent_depth = 1;
        let root = Agent::root("root", None, registry, c);
        let child = root.spawn(SpawnConfig::new("child")).await.unwrap();
        let err = child.spawn(SpawnConfig::new("grandchild")).await.unwrap_err();
        assert!(matches!(err, ConfigError::DepthExceeded { .. }));
    }

    #[tokio::test]
    async fn spawn_enforces_sub_agent_ceiling() {
        let registry = Arc::new(ProviderRegistry::new());
        let mut c = ceilings();
        c.max_sub_agents = 1;
        let root = Agent::root("root", None, registry, c);
        root.spawn(SpawnConfig::new("a")).await.unwrap();
        let err = root.spawn(SpawnConfig::new("b")).await.unwrap_err();
        assert!(matches!(err, ConfigError::TooManySubAgents { .. }));
    }

    #[tokio::test]
    async fn traversal_methods_cover_subtree() {
        let registry = Arc::new(ProviderRegistry::new());
        let root = Agent::root("root", None, registry, ceilings());
        let child = root.spawn(SpawnConfig::new("child")).await.unwrap();
        let grandchild = child.spawn(SpawnConfig::new("grandchild")).await.unwrap();

        assert_eq!(root.get_descendants().await.len(), 2);
        assert_eq!(grandchild.get_ancestors().await.len(), 2);
        assert!(root.is_ancestor_of(&grandchild.id).await);
        assert!(grandchild.is_descendant_of(&root.id).await);
        assert_eq!(grandchild.get_lineage_path().await, "root > child > grandchild");
        assert!(root.find_agent(&grandchild.id).await.is_some());
    }

    #[tokio::test]
    async fn remove_child_refuses_while_running() {
        let registry = Arc::new(ProviderRegistry::new());
        let root = Agent::root("root", None, registry, ceilings());
        let child = root.spawn(SpawnConfig::new("child")).await.unwrap();
        *child.status.write().await = AgentStatus::Running;
        assert!(!root.remove_child(&child.id).await);
        *child.status.write().await = AgentStatus::Completed;
        assert!(root.remove_child(&child.id).await);
    }

    #[tokio::test]
    async fn prune_children_removes_non_running_only() {
        let registry = Arc::new(ProviderRegistry::new());
        let root = Agent::root("root", None, registry, ceilings());
        let a = root.spawn(SpawnConfig::new("a")).await.unwrap();
        let _b = root.spawn(SpawnConfig::new("b")).await.unwrap();
        *a.status.write().await = AgentStatus::Running;
        let removed = root.prune_children().await;
        assert_eq!(removed, 1);
        assert_eq!(root.get_descendants().await.len(), 1);
    }

    #[tokio::test]
    async fn abort_cascades_to_running_children() {
        let registry = Arc::new(ProviderRegistry::new());
        let root = Agent::root("root", None, registry, ceilings());
        let child = root.spawn(SpawnConfig::new("child")).await.unwrap();
        *child.status.write().await = AgentStatus::Running;
        root.abort().await;
        assert_eq!(child.status().await, AgentStatus::Aborted);
    }

    #[tokio::test]
    async fn tool_call_round_trip_appends_tool_result() {
        struct ToolCallingAdapter;
        #[async_trait]
        impl ProviderAdapter for ToolCallingAdapter {
            fn id(&self) -> &str {
                "tooler"
            }
            fn name(&self) -> &str {
                "tooler"
            }
            fn models(&self) -> &[String] {
                &[]
            }
            async fn stream(&self, _model_id: &str, context: &AgentContext, _options: StreamOptions) -> EventStream {
                let already_called = context.messages().iter().any(|m| !m.tool_calls().is_empty());
                if already_called {
                    Box::pin(stream::iter(vec![
                        StreamEvent::Start { message_id: "m2".into() },
                        StreamEvent::Text { text: "done".into() },
                        StreamEvent::Done {
                            stop_reason: SR::EndTurn,
                            usage: Usage::default(),
                            cost: None,
                        },
                    ]))
                } else {
                    Box::pin(stream::iter(vec![
                        StreamEvent::Start { message_id: "m1".into() },
                        StreamEvent::ToolCall {
                            id: "t1".into(),
                            name: "echo".into(),
                            arguments: serde_json::json!({"x": 1}),
                        },
                        StreamEvent::Done {
                            stop_reason: SR::ToolUse,
                            usage: Usage::default(),
                            cost: None,
                        },
                    ]))
                }
            }
        }

        let registry = Arc::new(ProviderRegistry::new());
        registry.register(Arc::new(ToolCallingAdapter));
        let agent = Agent::root("root", None, registry, ceilings());
        agent.set_provider("tooler", "m", 0.5).await;
        agent.register_tool(Arc::new(EchoTool)).await.unwrap();
        let message = agent.prompt("hi").await.unwrap();
        assert_eq!(message.text_only(), "done");
        let ctx = agent.context().await;
        assert!(ctx.messages().iter().any(|m| m.role == crate::cloudllm::context::Role::ToolResult));
    }

    #[tokio::test]
    async fn policy_denial_skips_execution_and_marks_tool_result_error() {
        use crate::cloudllm::tool_handler::DenyListPolicy;

        struct ToolCallingAdapter;
        #[async_trait]
        impl ProviderAdapter for ToolCallingAdapter {
            fn id(&self) -> &str {
                "tooler"
            }
            fn name(&self) -> &str {
                "tooler"
            }
            fn models(&self) -> &[String] {
                &[]
            }
            async fn stream(&self, _model_id: &str, context: &AgentContext, _options: StreamOptions) -> EventStream {
                let already_called = context.messages().iter().any(|m| !m.tool_calls().is_empty());
                if already_called {
                    Box::pin(stream::iter(vec![
                        StreamEvent::Start { message_id: "m2".into() },
                        StreamEvent::Text { text: "done".into() },
                        StreamEvent::Done {
                            stop_reason: SR::EndTurn,
                            usage: Usage::default(),
                            cost: None,
                        },
                    ]))
                } else {
                    Box::pin(stream::iter(vec![
                        StreamEvent::Start { message_id: "m1".into() },
                        StreamEvent::ToolCall {
                            id: "t1".into(),
                            name: "calculator".into(),
                            arguments: serde_json::json!({"expression": "6*7"}),
                        },
                        StreamEvent::Done {
                            stop_reason: SR::ToolUse,
                            usage: Usage::default(),
                            cost: None,
                        },
                    ]))
                }
            }
        }

        let registry = Arc::new(ProviderRegistry::new());
        registry.register(Arc::new(ToolCallingAdapter));
        let root = Agent::root("root", None, registry, ceilings());
        let mut config = SpawnConfig::new("denied")
            .with_provider("tooler", "m", 0.5)
            .with_tools(vec![Arc::new(EchoTool)]);
        config.policy = Some(Arc::new(DenyListPolicy::new(["calculator"])));
        let agent = root.spawn(config).await.unwrap();

        let message = agent.prompt("what is 6 times 7?").await.unwrap();
        assert_eq!(message.text_only(), "done");
        let ctx = agent.context().await;
        let tool_result = ctx
            .messages()
            .iter()
            .find(|m| m.role == crate::cloudllm::context::Role::ToolResult)
            .expect("a tool_result message for the denied call");
        match &tool_result.content[0] {
            crate::cloudllm::context::ContentPart::ToolResult { content, is_error, .. } => {
                assert!(*is_error);
                assert!(content.starts_with("Policy denied"));
            }
            other => panic!("expected a ToolResult content part, got {other:?}"),
        }
    }
}
