//! Domain ports (interfaces) for the codeswarm orchestrator.
//!
//! Two external collaborators exist: the LLM provider used by the
//! orchestrator's own phases, and the agent spawner that runs workers.

pub mod provider;
pub mod spawner;

pub use provider::{
    ChatMessage, ChatOptions, ChatResponse, ChatRole, Provider, ProviderError, ProviderToolCall,
    TokenUsage,
};
pub use spawner::{AgentSpawner, SpawnResult, WorkerSpawnSpec};
