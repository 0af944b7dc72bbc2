//! [`ToolHandler`](crate::cloudllm::tool_handler::ToolHandler) adapters over the built-in
//! capabilities in [`crate::cloudllm::tools`] (§3 `ToolHandler`, §6 "Tool boundary").
//!
//! Each of the five built-in tools exposes a bespoke Rust API (`Calculator::evaluate`,
//! `BashTool::execute`, ...); these adapters are the thin seam that maps the JSON `args` an
//! agent's tool-dispatch step hands it (§4.6) onto that API and back into a
//! [`ToolExecutionResult`]. None of them hold agent state — they only wrap the tool they adapt.

use crate::cloudllm::cancellation::AbortSignal;
use crate::cloudllm::tool_handler::{ToolDefinition, ToolExecutionResult, ToolHandler};
use crate::cloudllm::tools::{BashTool, Calculator, FileSystemTool, HttpClient, Memory};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::error::Error;
use std::sync::Arc;

fn arg_str(args: &Value, name: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("missing required string argument '{name}'").into())
}

/// Adapts [`Calculator`] to [`ToolHandler`]. Grounded on S2/S3 in §8, which name a
/// `calculator` tool taking `{"expression": "..."}`.
pub struct CalculatorTool {
    inner: Calculator,
}

impl CalculatorTool {
    pub fn new() -> Self {
        Self { inner: Calculator::new() }
    }
}

impl Default for CalculatorTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolHandler for CalculatorTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "calculator",
            "Evaluates a scientific-calculator expression (arithmetic, trig, statistics).",
            json!({
                "type": "object",
                "properties": { "expression": { "type": "string" } },
                "required": ["expression"],
            }),
        )
    }

    async fn execute(
        &self,
        args: Value,
        _signal: &AbortSignal,
    ) -> Result<ToolExecutionResult, Box<dyn Error + Send + Sync>> {
        let expression = arg_str(&args, "expression")?;
        match self.inner.evaluate(&expression).await {
            Ok(value) => Ok(ToolExecutionResult::ok(value.to_string())),
            Err(e) => Ok(ToolExecutionResult::error(e.to_string())),
        }
    }
}

/// Adapts [`BashTool`]. Cancellation is best-effort: the underlying `tokio::process::Command`
/// isn't signal-aware, so a fired `signal` only cuts off the agent's *wait* on this call, not
/// the spawned process itself — matching §5's "abort any in-flight tool execution that
/// accepts a signal", which this one only partially does, intentionally documented here rather
/// than silently assumed.
pub struct BashExecTool {
    inner: BashTool,
}

impl BashExecTool {
    pub fn new(inner: BashTool) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ToolHandler for BashExecTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "bash",
            "Executes a shell command and returns its stdout/stderr/exit code.",
            json!({
                "type": "object",
                "properties": { "command": { "type": "string" } },
                "required": ["command"],
            }),
        )
    }

    async fn execute(
        &self,
        args: Value,
        signal: &AbortSignal,
    ) -> Result<ToolExecutionResult, Box<dyn Error + Send + Sync>> {
        let command = arg_str(&args, "command")?;
        if signal.is_aborted() {
            return Ok(ToolExecutionResult::error("aborted before execution"));
        }
        match self.inner.execute(&command).await {
            Ok(result) => {
                let content = if result.success {
                    result.stdout
                } else {
                    format!("exit {}: {}", result.exit_code, result.stderr)
                };
                Ok(ToolExecutionResult { content, is_error: !result.success })
            }
            Err(e) => Ok(ToolExecutionResult::error(e.to_string())),
        }
    }
}

/// Adapts [`FileSystemTool`]'s `read`/`write`/`delete`/`list` surface to a single `op`-keyed
/// tool, since §3 gives each `ToolHandler` one name.
pub struct FileSystemToolAdapter {
    inner: FileSystemTool,
}

impl FileSystemToolAdapter {
    pub fn new(inner: FileSystemTool) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ToolHandler for FileSystemToolAdapter {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "filesystem",
            "Reads, writes, lists, or deletes files under the tool's sandboxed root.",
            json!({
                "type": "object",
                "properties": {
                    "op": { "type": "string", "enum": ["read", "write", "append", "delete", "list", "exists"] },
                    "path": { "type": "string" },
                    "content": { "type": "string" },
                },
                "required": ["op", "path"],
            }),
        )
    }

    async fn execute(
        &self,
        args: Value,
        _signal: &AbortSignal,
    ) -> Result<ToolExecutionResult, Box<dyn Error + Send + Sync>> {
        let op = arg_str(&args, "op")?;
        let path = arg_str(&args, "path")?;
        let outcome = match op.as_str() {
            "read" => self.inner.read_file(&path).await.map(|s| s),
            "write" => {
                let content = arg_str(&args, "content").unwrap_or_default();
                self.inner.write_file(&path, &content).await.map(|_| "OK".to_string())
            }
            "append" => {
                let content = arg_str(&args, "content").unwrap_or_default();
                self.inner.append_file(&path, &content).await.map(|_| "OK".to_string())
            }
            "delete" => self.inner.delete_file(&path).await.map(|_| "OK".to_string()),
            "exists" => self.inner.file_exists(&path).await.map(|b| b.to_string()),
            "list" => self
                .inner
                .read_directory(&path, false)
                .await
                .map(|entries| json!(entries.into_iter().map(|e| e.name).collect::<Vec<_>>()).to_string()),
            other => return Ok(ToolExecutionResult::error(format!("unknown filesystem op '{other}'"))),
        };
        match outcome {
            Ok(content) => Ok(ToolExecutionResult::ok(content)),
            Err(e) => Ok(ToolExecutionResult::error(e.to_string())),
        }
    }
}

/// Adapts [`HttpClient`]'s per-verb methods to a single `method`-keyed tool.
pub struct HttpClientToolAdapter {
    inner: HttpClient,
}

impl HttpClientToolAdapter {
    pub fn new(inner: HttpClient) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ToolHandler for HttpClientToolAdapter {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "http_request",
            "Issues an HTTP request (get/post/put/patch/delete/head) to an allowlisted domain.",
            json!({
                "type": "object",
                "properties": {
                    "method": { "type": "string", "enum": ["get", "post", "put", "patch", "delete", "head"] },
                    "url": { "type": "string" },
                    "body": {},
                },
                "required": ["method", "url"],
            }),
        )
    }

    async fn execute(
        &self,
        args: Value,
        _signal: &AbortSignal,
    ) -> Result<ToolExecutionResult, Box<dyn Error + Send + Sync>> {
        let method = arg_str(&args, "method")?;
        let url = arg_str(&args, "url")?;
        let body = args.get("body").cloned().unwrap_or(Value::Null);
        let result = match method.as_str() {
            "get" => self.inner.get(&url).await,
            "post" => self.inner.post(&url, body).await,
            "put" => self.inner.put(&url, body).await,
            "patch" => self.inner.patch(&url, body).await,
            "delete" => self.inner.delete(&url).await,
            "head" => self.inner.head(&url).await,
            other => return Ok(ToolExecutionResult::error(format!("unknown http method '{other}'"))),
        };
        match result {
            Ok(response) => Ok(ToolExecutionResult {
                content: json!({ "status": response.status, "body": response.body }).to_string(),
                is_error: !response.is_success(),
            }),
            Err(e) => Ok(ToolExecutionResult::error(e.to_string())),
        }
    }
}

/// Adapts [`Memory`]'s `put`/`get`/`delete` surface to a single `op`-keyed tool so an agent
/// can persist scratch state across turns without going through the full session store.
pub struct MemoryToolAdapter {
    inner: Arc<Memory>,
}

impl MemoryToolAdapter {
    pub fn new(inner: Arc<Memory>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ToolHandler for MemoryToolAdapter {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "memory",
            "Puts, gets, or deletes a key/value pair in the agent's scratch memory store.",
            json!({
                "type": "object",
                "properties": {
                    "op": { "type": "string", "enum": ["put", "get", "delete", "list"] },
                    "key": { "type": "string" },
                    "value": { "type": "string" },
                    "ttl_seconds": { "type": "integer" },
                },
                "required": ["op"],
            }),
        )
    }

    async fn execute(
        &self,
        args: Value,
        _signal: &AbortSignal,
    ) -> Result<ToolExecutionResult, Box<dyn Error + Send + Sync>> {
        let op = arg_str(&args, "op")?;
        match op.as_str() {
            "put" => {
                let key = arg_str(&args, "key")?;
                let value = arg_str(&args, "value")?;
                let ttl = args.get("ttl_seconds").and_then(Value::as_u64);
                self.inner.put(key, value, ttl);
                Ok(ToolExecutionResult::ok("OK"))
            }
            "get" => {
                let key = arg_str(&args, "key")?;
                match self.inner.get(&key, false) {
                    Some((value, _meta)) => Ok(ToolExecutionResult::ok(value)),
                    None => Ok(ToolExecutionResult::error(format!("key '{key}' not found"))),
                }
            }
            "delete" => {
                let key = arg_str(&args, "key")?;
                Ok(ToolExecutionResult::ok(self.inner.delete(&key).to_string()))
            }
            "list" => Ok(ToolExecutionResult::ok(json!(self.inner.list_keys()).to_string())),
            other => Ok(ToolExecutionResult::error(format!("unknown memory op '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn calculator_tool_evaluates_expression() {
        let tool = CalculatorTool::new();
        let signal = AbortSignal::never();
        let result = tool.execute(json!({"expression": "6*7"}), &signal).await.unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content, "42");
    }

    #[tokio::test]
    async fn calculator_tool_reports_eval_error_as_tool_error() {
        let tool = CalculatorTool::new();
        let signal = AbortSignal::never();
        let result = tool.execute(json!({"expression": "1/0"}), &signal).await.unwrap();
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn memory_tool_round_trips() {
        let tool = MemoryToolAdapter::new(Arc::new(Memory::new()));
        let signal = AbortSignal::never();
        tool.execute(json!({"op": "put", "key": "k", "value": "v"}), &signal).await.unwrap();
        let got = tool.execute(json!({"op": "get", "key": "k"}), &signal).await.unwrap();
        assert_eq!(got.content, "v");
    }
}
