//! Error taxonomy (§7).
//!
//! Each subsystem gets its own hand-written error enum rather than one crate-wide catch-all,
//! mirroring `orchestration.rs::OrchestrationError` and `resource_protocol.rs::ResourceError`
//! in the rest of this codebase: a plain `enum`, a manual `impl fmt::Display`, and
//! `impl std::error::Error` with `source()` overridden wherever a causal chain applies. No
//! `thiserror`/`anyhow` is used anywhere in this crate.

use std::error::Error as StdError;
use std::fmt;

/// Configuration-class failures (§7): missing provider binding, missing API key, depth/count
/// ceilings exceeded. Fatal to the operation that raised them.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// No provider is bound to the agent attempting to prompt.
    NoProviderBound { agent_id: String },
    /// The named provider has no credentials available in the environment.
    MissingApiKey { provider_id: String, env_var: String },
    /// Spawning would exceed `MAX_AGENT_DEPTH`.
    DepthExceeded { attempted: u32, max: u32 },
    /// Spawning would exceed `MAX_SUB_AGENTS` for the parent.
    TooManySubAgents { parent_id: String, max: u32 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoProviderBound { agent_id } => {
                write!(f, "agent {agent_id} has no provider bound")
            }
            ConfigError::MissingApiKey { provider_id, env_var } => {
                write!(f, "provider {provider_id} has no credentials ({env_var} unset)")
            }
            ConfigError::DepthExceeded { attempted, max } => {
                write!(f, "agent depth {attempted} exceeds MAX_AGENT_DEPTH={max}")
            }
            ConfigError::TooManySubAgents { parent_id, max } => {
                write!(f, "agent {parent_id} already has MAX_SUB_AGENTS={max} children")
            }
        }
    }
}

impl StdError for ConfigError {}

/// Provider-transport-class failures (§7): connection failure, 5xx, 429, overloaded.
/// Retryable by [`crate::cloudllm::retry_stream`]; once the escalation chain in the Marga
/// pipeline is exhausted, the last such failure becomes the `cause` of a
/// [`PipelineError::ProvidersExhausted`].
#[derive(Debug, Clone)]
pub struct TransportError {
    pub provider_id: String,
    pub status_code: Option<u16>,
    pub message: String,
    pub retryable: bool,
    pub retry_after_ms: Option<u64>,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(
                f,
                "provider {} transport error (status {}): {}",
                self.provider_id, code, self.message
            ),
            None => write!(f, "provider {} transport error: {}", self.provider_id, self.message),
        }
    }
}

impl StdError for TransportError {}

impl TransportError {
    /// Classify an HTTP status code per §4.1: 429/500/502/503/529 are retryable, other 4xx
    /// are not.
    pub fn retryable_for_status(status: u16) -> bool {
        matches!(status, 429 | 500 | 502 | 503 | 529)
    }

    pub fn auth(provider_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            status_code: Some(401),
            message: message.into(),
            retryable: false,
            retry_after_ms: None,
        }
    }
}

/// Raised when the Marga pipeline's escalation chain (§4.5) is exhausted without a
/// provider completing successfully.
#[derive(Debug)]
pub struct PipelineError {
    pub attempted_providers: Vec<String>,
    pub cause: TransportError,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "all providers exhausted after trying [{}]; last failure: {}",
            self.attempted_providers.join(", "),
            self.cause
        )
    }
}

impl StdError for PipelineError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.cause)
    }
}

/// Raised by the agent prompt loop (§4.6) for non-tool, non-cancellation failures.
#[derive(Debug)]
pub enum AgentError {
    /// `prompt()` called while the agent is already mid-prompt.
    Conflict { agent_id: String, status: String },
    Config(ConfigError),
    Pipeline(PipelineError),
    /// The prompt's abort signal fired before the loop reached a terminal state (§5
    /// "Cancellation").
    Aborted { agent_id: String },
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Conflict { agent_id, status } => {
                write!(f, "agent {agent_id} cannot accept a prompt in status {status}")
            }
            AgentError::Config(e) => write!(f, "{e}"),
            AgentError::Pipeline(e) => write!(f, "{e}"),
            AgentError::Aborted { agent_id } => write!(f, "agent {agent_id}'s prompt was aborted"),
        }
    }
}

impl StdError for AgentError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            AgentError::Config(e) => Some(e),
            AgentError::Pipeline(e) => Some(e),
            AgentError::Conflict { .. } | AgentError::Aborted { .. } => None,
        }
    }
}

impl From<ConfigError> for AgentError {
    fn from(e: ConfigError) -> Self {
        AgentError::Config(e)
    }
}

impl From<PipelineError> for AgentError {
    fn from(e: PipelineError) -> Self {
        AgentError::Pipeline(e)
    }
}

/// Persistence-class failures: anything that prevents a round-trip to the duck-typed store
/// entirely (row-level parse failures are *not* represented here — §7 has those skipped
/// silently and logged, not raised).
#[derive(Debug)]
pub struct PersistenceError {
    pub operation: String,
    pub message: String,
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "persistence error during {}: {}", self.operation, self.message)
    }
}

impl StdError for PersistenceError {}
