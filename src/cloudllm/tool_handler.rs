//! The tool boundary (§3 `ToolHandler`, §6 "Tool boundary", §4.6 "Tool dispatch").
//!
//! Generalizes `tool_protocol.rs::ToolProtocol` from a multi-protocol routing layer down to
//! the minimal shape the spec calls for: a named capability with a JSON-schema input and an
//! `execute(args) -> {content, is_error}` entry point, plus an optional policy check consulted
//! before every dispatch. Concrete handlers (calculator, filesystem, bash, http, memory) live
//! under [`crate::cloudllm::tools`] and implement this trait directly rather than going
//! through a protocol-discovery round trip.

use crate::cloudllm::cancellation::AbortSignal;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Declares a tool's name and JSON-schema input shape (§6 "Tool boundary").
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// The outcome of `ToolHandler::execute` (§3).
#[derive(Debug, Clone)]
pub struct ToolExecutionResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolExecutionResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// An effectful capability registered on an agent (§3 `ToolHandler`).
///
/// Implementations must not mutate agent state directly, and must honor `signal` when it is
/// set — the tool executor passes the current prompt's [`AbortSignal`] so long-running tools
/// (bash, http) can cancel promptly when the agent's prompt is aborted (§5 "Cancellation").
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn execute(
        &self,
        args: Value,
        signal: &AbortSignal,
    ) -> Result<ToolExecutionResult, Box<dyn Error + Send + Sync>>;
}

/// `{allowed, reason?}` — whether a tool call may proceed (§6 "Policy engine boundary").
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Optional gate consulted before every tool dispatch (§4.6). When absent, every call is
/// allowed.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn check(&self, tool_name: &str, args: &Value) -> PolicyDecision;
}

/// A [`PolicyEngine`] that allows everything — the default when an agent has none configured.
pub struct AllowAllPolicy;

#[async_trait]
impl PolicyEngine for AllowAllPolicy {
    async fn check(&self, _tool_name: &str, _args: &Value) -> PolicyDecision {
        PolicyDecision::allow()
    }
}

/// A [`PolicyEngine`] that denies a fixed set of tool names by exact match, for tests and for
/// simple allow/deny-list deployments.
#[derive(Default)]
pub struct DenyListPolicy {
    denied: std::collections::HashSet<String>,
}

impl DenyListPolicy {
    pub fn new(denied: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            denied: denied.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl PolicyEngine for DenyListPolicy {
    async fn check(&self, tool_name: &str, _args: &Value) -> PolicyDecision {
        if self.denied.contains(tool_name) {
            PolicyDecision::deny(format!("tool '{tool_name}' is denied by policy"))
        } else {
            PolicyDecision::allow()
        }
    }
}

#[derive(Debug)]
pub struct DuplicateToolError {
    pub name: String,
}

impl fmt::Display for DuplicateToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a tool named '{}' is already registered", self.name)
    }
}

impl Error for DuplicateToolError {}

/// The set of tools bound to one agent (§3: "name unique within an agent"; "set bounded by
/// agent config"). Registration is dynamic — tools can be added and removed at runtime.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    max_tools: Option<usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_tools(mut self, max: usize) -> Self {
        self.max_tools = Some(max);
        self
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) -> Result<(), DuplicateToolError> {
        let name = handler.definition().name;
        if self.handlers.contains_key(&name) {
            return Err(DuplicateToolError { name });
        }
        if let Some(max) = self.max_tools {
            if self.handlers.len() >= max {
                return Err(DuplicateToolError {
                    name: format!("{name} (registry full at {max} tools)"),
                });
            }
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.handlers.values().map(|h| h.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("echo", "echoes its input", serde_json::json!({"type": "object"}))
        }

        async fn execute(
            &self,
            args: Value,
            _signal: &AbortSignal,
        ) -> Result<ToolExecutionResult, Box<dyn Error + Send + Sync>> {
            Ok(ToolExecutionResult::ok(args.to_string()))
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let err = registry.register(Arc::new(EchoTool)).unwrap_err();
        assert_eq!(err.name, "echo");
    }

    #[tokio::test]
    async fn deny_list_blocks_named_tool() {
        let policy = DenyListPolicy::new(["echo"]);
        let decision = policy.check("echo", &Value::Null).await;
        assert!(!decision.allowed);
        let decision = policy.check("calculator", &Value::Null).await;
        assert!(decision.allowed);
    }
}
