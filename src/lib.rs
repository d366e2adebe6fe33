//! Codeswarm - multi-agent swarm orchestration core.
//!
//! Given a coarse goal, the orchestrator decomposes it into a dependency DAG
//! of subtasks, dispatches them in waves to capability-matched workers,
//! enforces a shared token budget across the tree, detects file-write
//! conflicts under optimistic concurrency, applies per-task quality gates
//! with recovery (circuit breaker, auto-split, degraded acceptance, mid-run
//! replan), and emits a live event stream for external observers.
//!
//! External collaborators plug in through two ports: a [`Provider`] for the
//! orchestrator's own LLM calls, and an [`AgentSpawner`] for running workers.
//!
//! [`Provider`]: domain::ports::Provider
//! [`AgentSpawner`]: domain::ports::AgentSpawner

pub mod adapters;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::errors::{SwarmError, SwarmResult};
pub use domain::models::{
    SwarmCheckpoint, SwarmConfig, SwarmEvent, SwarmExecutionResult, SwarmStatus, SwarmTask,
    SwarmTaskResult,
};
pub use services::orchestrator::{SwarmOrchestrator, SwarmRunContext};
