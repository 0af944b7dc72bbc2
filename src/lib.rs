// src/lib.rs

// Import the top-level `cloudllm` module.
pub mod cloudllm;

// Re-exporting key items for easier external access, so callers don't have to navigate the
// whole module hierarchy for the types they'll touch most often.
pub use cloudllm::agent_tree::{Agent, AgentStatus, ProviderBinding, SpawnConfig};
pub use cloudllm::comm_hub::CommHub;
pub use cloudllm::config::{BindingProfile, RuntimeConfig};
pub use cloudllm::context::{AgentContext, ContentPart, Message, Role};
pub use cloudllm::kartavya::KartavyaEngine;
pub use cloudllm::pipeline::{Pipeline, PipelineDecision};
pub use cloudllm::provider::{ProviderAdapter, ProviderRegistry, GLOBAL_PROVIDER_REGISTRY};
pub use cloudllm::supervisor::KaalaBrahma;
