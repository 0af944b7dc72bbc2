//! Runtime configuration for the agent runtime.
//!
//! Provides [`RuntimeConfig`], the top-level, builder-constructed settings object that
//! selects a binding profile (§4.5 LOCAL/CLOUD/HYBRID), resolves provider credentials from
//! the environment, and carries the resource ceilings from the concurrency model. No
//! TOML/YAML/JSON config-file parser is introduced: values are either defaulted, read from
//! named environment variables, or set explicitly through builder methods.
//!
//! # Example
//!
//! ```rust
//! use sutradhar::cloudllm::config::{RuntimeConfig, BindingProfile};
//!
//! let config = RuntimeConfig::default()
//!     .with_profile(BindingProfile::Hybrid)
//!     .with_max_agent_depth(6);
//! assert_eq!(config.profile, BindingProfile::Hybrid);
//! ```

use std::path::PathBuf;

/// Which pre-defined task→model binding table (§4.5) the Marga pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindingProfile {
    /// Route everything to locally hosted models (e.g. Ollama).
    Local,
    /// Route everything to cloud providers.
    #[default]
    Cloud,
    /// Route cheap/local-friendly task types locally, escalate the rest to cloud.
    Hybrid,
}

/// Resource ceilings from §5, hard-capped regardless of configured overrides.
#[derive(Debug, Clone, Copy)]
pub struct ResourceCeilings {
    /// Maximum depth of the agent tree (root = depth 0).
    pub max_agent_depth: u32,
    /// Maximum number of direct children per agent.
    pub max_sub_agents: u32,
    /// Hard ceiling on concurrently active Kartavyas.
    pub kartavya_max_active: u32,
    /// Hard ceiling on Kartavya executions per rolling hour.
    pub kartavya_max_executions_per_hour: u32,
    /// Hard floor on Kartavya cooldown, in milliseconds.
    pub kartavya_min_cooldown_ms: u64,
}

impl Default for ResourceCeilings {
    fn default() -> Self {
        Self {
            max_agent_depth: 8,
            max_sub_agents: 16,
            kartavya_max_active: 100,
            kartavya_max_executions_per_hour: 60,
            kartavya_min_cooldown_ms: 10_000,
        }
    }
}

impl ResourceCeilings {
    /// Clamp a requested configuration to the hard ceilings, never exceeding them.
    pub fn clamp(&self, requested: ResourceCeilings) -> ResourceCeilings {
        ResourceCeilings {
            max_agent_depth: requested.max_agent_depth.min(self.max_agent_depth),
            max_sub_agents: requested.max_sub_agents.min(self.max_sub_agents),
            kartavya_max_active: requested.kartavya_max_active.min(self.kartavya_max_active),
            kartavya_max_executions_per_hour: requested
                .kartavya_max_executions_per_hour
                .min(self.kartavya_max_executions_per_hour),
            kartavya_min_cooldown_ms: requested
                .kartavya_min_cooldown_ms
                .max(self.kartavya_min_cooldown_ms),
        }
    }
}

/// Environment variable names consulted when resolving provider credentials (§6).
pub const PROVIDER_ENV_VARS: &[(&str, &str)] = &[
    ("anthropic", "ANTHROPIC_API_KEY"),
    ("openai", "OPENAI_API_KEY"),
    ("xai", "XAI_API_KEY"),
    ("groq", "GROQ_API_KEY"),
    ("cerebras", "CEREBRAS_API_KEY"),
    ("mistral", "MISTRAL_API_KEY"),
    ("deepseek", "DEEPSEEK_API_KEY"),
    ("openrouter", "OPENROUTER_API_KEY"),
    ("together", "TOGETHER_API_KEY"),
];

/// Default Ollama base URL used when `OLLAMA_HOST` is unset.
pub const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";

/// Top-level runtime configuration.
///
/// Constructed via [`RuntimeConfig::default`] plus `with_*` builder calls, mirroring the
/// rest of the crate's preference for builder methods over field-literal construction.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Active binding profile for the Marga pipeline.
    pub profile: BindingProfile,
    /// Resource ceilings, already clamped to the hard defaults.
    pub ceilings: ResourceCeilings,
    /// Directory backing the Kartavya/session persistence layer (duck-typed store, §6).
    pub data_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            profile: BindingProfile::default(),
            ceilings: ResourceCeilings::default(),
            data_dir: PathBuf::from("sutradhar_data"),
        }
    }
}

impl RuntimeConfig {
    /// Select the binding profile.
    pub fn with_profile(mut self, profile: BindingProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Override the maximum agent-tree depth (clamped to the hard ceiling).
    pub fn with_max_agent_depth(mut self, depth: u32) -> Self {
        self.ceilings.max_agent_depth = depth.min(ResourceCeilings::default().max_agent_depth);
        self
    }

    /// Override the maximum number of sub-agents per parent (clamped to the hard ceiling).
    pub fn with_max_sub_agents(mut self, count: u32) -> Self {
        self.ceilings.max_sub_agents = count.min(ResourceCeilings::default().max_sub_agents);
        self
    }

    /// Override the data directory used by the persistence boundary.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Resolve the configured API key for a provider id by reading its named
    /// environment variable. Returns `None` if the variable is unset or the provider id is
    /// unrecognized — callers treat a missing key as "provider absent from the registry",
    /// never as a hard failure (§6).
    pub fn resolve_provider_key(provider_id: &str) -> Option<String> {
        let var_name = PROVIDER_ENV_VARS
            .iter()
            .find(|(id, _)| *id == provider_id)
            .map(|(_, var)| *var)?;
        std::env::var(var_name).ok()
    }

    /// Resolve the Ollama host, defaulting to [`DEFAULT_OLLAMA_HOST`].
    pub fn ollama_host() -> String {
        std::env::var("OLLAMA_HOST").unwrap_or_else(|_| DEFAULT_OLLAMA_HOST.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_is_cloud() {
        assert_eq!(RuntimeConfig::default().profile, BindingProfile::Cloud);
    }

    #[test]
    fn ceilings_clamp_to_hard_caps() {
        let hard = ResourceCeilings::default();
        let requested = ResourceCeilings {
            max_agent_depth: 999,
            max_sub_agents: 999,
            kartavya_max_active: 999,
            kartavya_max_executions_per_hour: 999,
            kartavya_min_cooldown_ms: 0,
        };
        let clamped = hard.clamp(requested);
        assert_eq!(clamped.max_agent_depth, hard.max_agent_depth);
        assert_eq!(clamped.kartavya_max_active, hard.kartavya_max_active);
        assert_eq!(clamped.kartavya_min_cooldown_ms, hard.kartavya_min_cooldown_ms);
    }

    #[test]
    fn unknown_provider_resolves_to_none() {
        assert!(RuntimeConfig::resolve_provider_key("does-not-exist").is_none());
    }
}
