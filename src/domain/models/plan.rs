//! Decomposition plans, run phases, status snapshots, and checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::budget::BudgetPoolStats;
use super::event::SwarmEvent;
use super::task::{SwarmTask, SwarmTaskResult, TaskPriority, TaskType};
use super::worker::SwarmWorkerStatus;

/// One subtask as produced by the decomposition model.
///
/// This is the deserialization target for LLM output, so every field is
/// forgiving: unknown types fall back to `implement`, priorities clamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartSubtask {
    pub id: String,
    pub description: String,
    #[serde(default, rename = "type")]
    pub task_type: Option<String>,
    #[serde(default)]
    pub complexity: Option<u8>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

impl SmartSubtask {
    /// Convert into a queue-ready task.
    pub fn into_task(self) -> SwarmTask {
        let task_type = self
            .task_type
            .as_deref()
            .and_then(TaskType::from_str)
            .unwrap_or_default();
        let mut task = SwarmTask::new(self.id, self.description, task_type)
            .with_complexity(self.complexity.unwrap_or(3))
            .with_dependencies(self.dependencies)
            .with_target_files(self.target_files)
            .with_priority(
                self.priority
                    .map_or(TaskPriority::Normal, TaskPriority::from_rank),
            );
        task.acceptance_criteria = self.acceptance_criteria;
        task
    }
}

/// Parsed output of the decomposition phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmartDecompositionResult {
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub subtasks: Vec<SmartSubtask>,
}

/// Orchestrator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmPhase {
    Idle,
    Decomposing,
    Planning,
    Executing,
    Replanning,
    Verifying,
    Synthesizing,
    Completed,
    Failed,
}

impl Default for SwarmPhase {
    fn default() -> Self {
        Self::Idle
    }
}

impl SwarmPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Decomposing => "decomposing",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Replanning => "replanning",
            Self::Verifying => "verifying",
            Self::Synthesizing => "synthesizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Queue occupancy counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmQueueStats {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl SwarmQueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.ready + self.running + self.completed + self.failed + self.skipped
    }
}

/// Live snapshot of the whole swarm, as consumed by observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmStatus {
    pub phase: SwarmPhase,
    pub current_wave: usize,
    pub total_waves: usize,
    pub queue: SwarmQueueStats,
    pub workers: Vec<SwarmWorkerStatus>,
    pub budget: BudgetPoolStats,
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunReason {
    Completed,
    Empty,
    Budget,
    Cancelled,
    FailedTasks,
    Config,
    Internal,
}

impl RunReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Empty => "empty",
            Self::Budget => "budget",
            Self::Cancelled => "cancelled",
            Self::FailedTasks => "failed_tasks",
            Self::Config => "config",
            Self::Internal => "internal",
        }
    }
}

/// Aggregate counters for a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SwarmExecutionStats {
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub degraded: usize,
    pub waves: usize,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

/// Outcome of one verification prompt over a completed task's artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub task_id: String,
    pub passed: bool,
    #[serde(default)]
    pub notes: String,
}

/// Final result handed back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmExecutionResult {
    pub success: bool,
    pub reason: RunReason,
    pub task_results: Vec<SwarmTaskResult>,
    pub stats: SwarmExecutionStats,
    /// Every artifact path touched by an accepted task.
    pub artifacts: Vec<String>,
    /// Artifacts left on disk by tasks that ended up skipped; persisted but
    /// excluded from the success tally.
    pub skipped_with_artifacts: Vec<String>,
    pub verification: Vec<VerificationResult>,
    #[serde(default)]
    pub summary: String,
    pub duration_ms: u64,
}

/// Serialized economics state: fingerprint -> worker -> count.
pub type EconomicsSnapshot = BTreeMap<String, BTreeMap<String, u64>>;

/// Serialized budget pool state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetPoolSnapshot {
    pub uncommitted: u64,
    pub used_total: u64,
    pub parent_used: u64,
    pub expected_children: usize,
    pub outstanding: Vec<super::budget::BudgetAllocation>,
}

/// Serialized queue bookkeeping beyond what tasks themselves carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub current_wave: usize,
    pub total_waves: usize,
    pub rescued: Vec<String>,
    pub auto_splits_used: u32,
}

/// Full restorable snapshot of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmCheckpoint {
    pub run_id: Uuid,
    pub goal: String,
    pub phase: SwarmPhase,
    pub tasks: Vec<SwarmTask>,
    pub queue: QueueSnapshot,
    pub economics: EconomicsSnapshot,
    pub budget: BudgetPoolSnapshot,
    /// Recent events only; history is advisory and may differ after restore.
    pub events: Vec<SwarmEvent>,
    pub saved_at: DateTime<Utc>,
}
