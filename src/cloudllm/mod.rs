// src/cloudllm/mod.rs

pub mod adaptive_scorer;
pub mod agent_tree;
pub mod cancellation;
pub mod classifier;
pub mod comm_hub;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod fact_extractor;
pub mod http_client_pool;
pub mod kartavya;
pub mod mhc_allocator;
pub mod pipeline;
pub mod provider;
pub mod providers;
pub mod rate_limiter;
pub mod request_queue;
pub mod retry_stream;
pub mod supervisor;
pub mod tool_adapters;
pub mod tool_handler;
pub mod tools;

// Let's explicitly export the tree root so callers can reach it as cloudllm::Agent instead of
// having to navigate the whole module path.
pub use agent_tree::Agent;
