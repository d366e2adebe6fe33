//! Swarm run configuration.
//!
//! `SwarmConfig` is immutable once a run starts. Per-task-type tuning lives
//! in the built-in [`TaskTypeConfig`] table.

use serde::{Deserialize, Serialize};

use super::budget::BudgetPoolConfig;
use super::task::TaskType;
use super::worker::SwarmWorkerSpec;

/// How the wave scheduler resolves tasks whose target files overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileConflictStrategy {
    /// Keep all overlapping tasks, dispatching them in consecutive waves.
    Serialize,
    /// Dispatch the first task; the rest are skipped with a conflict event.
    FirstWins,
}

impl Default for FileConflictStrategy {
    fn default() -> Self {
        Self::Serialize
    }
}

/// Quality gate and retry tuning for a task type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskTypeConfig {
    /// Minimum judge/inventory score for plain acceptance.
    pub acceptance_threshold: f64,
    /// Transient failures tolerated before the task is marked failed.
    pub retry_limit: u32,
    /// Minimum complexity at which repeated failure triggers auto-split.
    pub auto_split_complexity: u8,
    /// Whether sub-threshold results with artifacts may be accepted degraded.
    pub degraded_acceptable: bool,
    /// Whether an empty artifact set fails the pre-flight check.
    pub requires_artifacts: bool,
}

impl TaskTypeConfig {
    /// Built-in tuning table. Values follow the production defaults.
    pub fn for_type(task_type: TaskType) -> Self {
        match task_type {
            TaskType::Implement | TaskType::Fix | TaskType::Integrate => Self {
                acceptance_threshold: 0.75,
                retry_limit: 2,
                auto_split_complexity: 4,
                degraded_acceptable: true,
                requires_artifacts: true,
            },
            TaskType::Refactor => Self {
                acceptance_threshold: 0.75,
                retry_limit: 2,
                auto_split_complexity: 4,
                degraded_acceptable: false,
                requires_artifacts: true,
            },
            TaskType::Research | TaskType::Design => Self {
                acceptance_threshold: 0.60,
                retry_limit: 1,
                auto_split_complexity: 5,
                degraded_acceptable: true,
                requires_artifacts: false,
            },
            TaskType::Review | TaskType::Test => Self {
                acceptance_threshold: 0.70,
                retry_limit: 1,
                auto_split_complexity: 5,
                degraded_acceptable: false,
                requires_artifacts: false,
            },
            TaskType::Documentation => Self {
                acceptance_threshold: 0.60,
                retry_limit: 1,
                auto_split_complexity: 5,
                degraded_acceptable: true,
                requires_artifacts: true,
            },
        }
    }

    /// Degraded floor: half the normal threshold.
    pub fn degraded_threshold(&self) -> f64 {
        self.acceptance_threshold * 0.5
    }
}

/// Circuit breaker and stagger tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Sliding window over rate-limit events.
    pub circuit_breaker_window_ms: u64,
    /// Rate-limit count within the window that trips the breaker.
    pub circuit_breaker_threshold: usize,
    /// Dispatch pause once the breaker trips.
    pub circuit_breaker_pause_ms: u64,
    /// Upper bound for the adaptive inter-spawn stagger.
    pub max_stagger_ms: u64,
    /// Stall ticks (pending > 0, ready == 0, no completions) before replan.
    pub stall_ticks_before_replan: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            circuit_breaker_window_ms: 30_000,
            circuit_breaker_threshold: 3,
            circuit_breaker_pause_ms: 15_000,
            max_stagger_ms: 5_000,
            stall_ticks_before_replan: 2,
        }
    }
}

/// Process-wide swarm configuration, immutable once a run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Model used by the orchestrator itself (decompose, judge, replan).
    pub orchestrator_model: String,
    /// Maximum concurrent workers.
    pub max_workers: usize,
    /// Enable the LLM judge stage of the quality gate.
    pub use_judge: bool,
    /// Judge model override; falls back to `orchestrator_model`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_model: Option<String>,
    /// Enable the post-wave critic review.
    pub critic_enabled: bool,
    /// Run per-task verification prompts after execution.
    pub verification_enabled: bool,
    /// File conflict policy for wave composition.
    pub conflict_strategy: FileConflictStrategy,
    /// Whether a judge `fixup` verdict consumes a retry slot.
    pub fixup_counts_as_retry: bool,
    /// Cap on auto-split rounds across the whole run.
    pub max_auto_splits: u32,
    /// Per-task timeout is `base_timeout_ms * complexity`.
    pub base_timeout_ms: u64,
    /// Added to the largest task timeout to form the wave timeout.
    pub wave_timeout_slack_ms: u64,
    /// Provider call timeout for orchestrator-side calls.
    pub provider_timeout_ms: u64,
    /// Cross-worker identical-call threshold for the global loop detector.
    pub global_doom_threshold: u64,
    pub recovery: RecoveryConfig,
    pub budget: BudgetPoolConfig,
    /// Worker roster; empty means fallback workers only.
    #[serde(default)]
    pub workers: Vec<SwarmWorkerSpec>,
    /// Default model for fallback workers.
    pub default_worker_model: String,
    /// Run-state directory; `None` disables on-disk artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_root: Option<std::path::PathBuf>,
    /// Append every event to `swarm.events.jsonl` under `run_root`.
    pub persist_events: bool,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            orchestrator_model: "claude-sonnet-4-5".to_string(),
            max_workers: 4,
            use_judge: true,
            judge_model: None,
            critic_enabled: false,
            verification_enabled: true,
            conflict_strategy: FileConflictStrategy::default(),
            fixup_counts_as_retry: false,
            max_auto_splits: 3,
            base_timeout_ms: 120_000,
            wave_timeout_slack_ms: 30_000,
            provider_timeout_ms: 60_000,
            global_doom_threshold: 10,
            recovery: RecoveryConfig::default(),
            budget: BudgetPoolConfig::default(),
            workers: Vec::new(),
            default_worker_model: "claude-sonnet-4-5".to_string(),
            run_root: None,
            persist_events: false,
        }
    }
}

impl SwarmConfig {
    /// Per-task timeout scaled by complexity.
    pub fn task_timeout_ms(&self, complexity: u8) -> u64 {
        self.base_timeout_ms * u64::from(complexity.clamp(1, 5))
    }

    pub fn judge_model(&self) -> &str {
        self.judge_model.as_deref().unwrap_or(&self.orchestrator_model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table_covers_all_types() {
        for t in TaskType::all() {
            let cfg = TaskTypeConfig::for_type(*t);
            assert!(cfg.acceptance_threshold > 0.0 && cfg.acceptance_threshold <= 1.0);
            assert!(cfg.retry_limit >= 1);
        }
    }

    #[test]
    fn test_implement_defaults() {
        let cfg = TaskTypeConfig::for_type(TaskType::Implement);
        assert!((cfg.acceptance_threshold - 0.75).abs() < f64::EPSILON);
        assert_eq!(cfg.retry_limit, 2);
        assert_eq!(cfg.auto_split_complexity, 4);
        assert!(cfg.degraded_acceptable);
        assert!(cfg.requires_artifacts);
    }

    #[test]
    fn test_task_timeout_scales_with_complexity() {
        let config = SwarmConfig::default();
        assert_eq!(config.task_timeout_ms(1), config.base_timeout_ms);
        assert_eq!(config.task_timeout_ms(5), config.base_timeout_ms * 5);
        // Out-of-range complexity clamps.
        assert_eq!(config.task_timeout_ms(9), config.base_timeout_ms * 5);
    }

    #[test]
    fn test_degraded_threshold_is_half() {
        let cfg = TaskTypeConfig::for_type(TaskType::Implement);
        assert!((cfg.degraded_threshold() - 0.375).abs() < f64::EPSILON);
    }
}
