//! Agent event system (§4.6 "Event fan-out").
//!
//! Every agent emits a flat set of named events as it runs its prompt loop. A parent agent
//! observes every event emitted by any descendant through a bubbling wrapper
//! ([`AgentEvent::SubagentEvent`]), nested once per hop, unless the spawn opted out via
//! `bubble_events: false`.
//!
//! Handlers implement [`EventHandler`], whose methods default to no-ops so callers only
//! override what they care about — the same shape as `EventHandler` elsewhere in this crate.

use crate::cloudllm::context::ContentPart;
use async_trait::async_trait;
use serde_json::Value;

/// The closed set of events an [`crate::cloudllm::agent::Agent`] emits (§4.6).
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// `agent:start` — a provider stream began.
    Start { message_id: String },
    /// `agent:text` — an incremental text delta.
    Text { text: String },
    /// `agent:thinking` — an incremental thinking/reasoning delta.
    Thinking { text: String },
    /// `agent:tool_call` — a tool call was assembled from the stream.
    ToolCall { id: String, name: String, arguments: Value },
    /// `agent:tool_result` — a tool call's dispatch result, before it is appended to context.
    ToolResult { tool_call_id: String, content: String, is_error: bool },
    /// `agent:usage` — usage reported mid-stream; may occur multiple times per turn.
    Usage { input_tokens: u64, output_tokens: u64, cache_read_tokens: Option<u64> },
    /// `agent:done` — the provider stream terminated normally.
    Done { stop_reason: String },
    /// `agent:abort` — the agent's in-flight prompt was cancelled.
    Abort,
    /// `agent:error` — a terminal error ended the prompt loop.
    Error { message: String },
    /// `subagent:spawn` — a child agent was created.
    SubagentSpawn { child_id: String, purpose: String },
    /// `subagent:event` — a bubbled event from a descendant, wrapped once per hop between the
    /// originating agent and the observer.
    SubagentEvent {
        source_agent_id: String,
        source_purpose: String,
        source_depth: u32,
        original: Box<AgentEvent>,
    },
}

impl AgentEvent {
    /// Wrap this event as having bubbled up one more hop from `source`.
    pub fn bubble(self, source_agent_id: impl Into<String>, source_purpose: impl Into<String>, source_depth: u32) -> AgentEvent {
        AgentEvent::SubagentEvent {
            source_agent_id: source_agent_id.into(),
            source_purpose: source_purpose.into(),
            source_depth,
            original: Box::new(self),
        }
    }

    /// Number of `SubagentEvent` wraps around this event — used by tests asserting the
    /// "nested exactly d times" bubbling invariant (§8).
    pub fn bubble_depth(&self) -> u32 {
        match self {
            AgentEvent::SubagentEvent { original, .. } => 1 + original.bubble_depth(),
            _ => 0,
        }
    }
}

impl From<&ContentPart> for Option<AgentEvent> {
    fn from(part: &ContentPart) -> Self {
        match part {
            ContentPart::Text { text } => Some(AgentEvent::Text { text: text.clone() }),
            ContentPart::Thinking { text } => Some(AgentEvent::Thinking { text: text.clone() }),
            ContentPart::ToolCall { id, name, arguments } => Some(AgentEvent::ToolCall {
                id: id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
            }),
            ContentPart::ToolResult { tool_call_id, content, is_error } => Some(AgentEvent::ToolResult {
                tool_call_id: tool_call_id.clone(),
                content: content.clone(),
                is_error: *is_error,
            }),
            ContentPart::Image { .. } => None,
        }
    }
}

/// Status transitions emitted by the supervisor (§4.8).
#[derive(Debug, Clone)]
pub struct SupervisorEvent {
    pub agent_id: String,
    pub old_status: String,
    pub new_status: String,
    pub reason: Option<String>,
}

/// Receives agent and supervisor events. Both methods default to no-ops.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for every event an [`crate::cloudllm::agent_tree::Agent`] emits, including
    /// bubbled `SubagentEvent`s observed by an ancestor.
    async fn on_agent_event(&self, _agent_id: &str, _event: &AgentEvent) {}

    /// Called on every KaalaBrahma status transition.
    async fn on_supervisor_event(&self, _event: &SupervisorEvent) {}
}

/// An [`EventHandler`] that drops every event. The default when an agent is constructed
/// without `with_event_handler`.
pub struct NullEventHandler;

#[async_trait]
impl EventHandler for NullEventHandler {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bubble_nests_exactly_once_per_hop() {
        let leaf = AgentEvent::Text { text: "hi".into() };
        assert_eq!(leaf.bubble_depth(), 0);
        let once = leaf.bubble("child", "worker", 2);
        assert_eq!(once.bubble_depth(), 1);
        let twice = once.bubble("root", "root-purpose", 1);
        assert_eq!(twice.bubble_depth(), 2);
    }
}
