//! Agent spawner port - interface to the worker backend.
//!
//! The pool hands a fully assembled spec to this trait; how the worker runs
//! (subprocess, API session, remote container) is an adapter concern.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::domain::models::task::{FailureMode, SwarmTask};
use crate::domain::models::worker::WorkerCapability;
use crate::services::cancellation::CancellationToken;
use crate::services::file_ledger::FileLedger;

/// Everything a worker backend needs to execute one task.
#[derive(Debug, Clone)]
pub struct WorkerSpawnSpec {
    pub task: SwarmTask,
    pub system_prompt: String,
    /// Token budget granted by the shared pool.
    pub budget_tokens: u64,
    pub capabilities: BTreeSet<WorkerCapability>,
    pub model: String,
    pub working_dir: PathBuf,
    /// Run file ledger; artifact writes go through its optimistic-concurrency
    /// protocol so stale-base edits surface as conflicts instead of clobbers.
    pub ledger: Arc<FileLedger>,
    /// Linked to the run root; the backend must stop promptly when set.
    pub cancel: CancellationToken,
}

/// Raw outcome of a worker run, before quality gating.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnResult {
    pub success: bool,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub artifacts_changed: Vec<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_mode: Option<FailureMode>,
    /// Unclassified error text (stderr tail, exception message).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_error: Option<String>,
}

impl SpawnResult {
    pub fn failed(raw_error: impl Into<String>) -> Self {
        Self {
            success: false,
            raw_error: Some(raw_error.into()),
            ..Self::default()
        }
    }
}

/// Trait for worker backends.
///
/// Infallible at the port boundary: failures are reported inside the
/// [`SpawnResult`] so the pool can classify them.
#[async_trait]
pub trait AgentSpawner: Send + Sync {
    async fn spawn(&self, spec: WorkerSpawnSpec) -> SpawnResult;
}
