//! Task domain model.
//!
//! Swarm tasks are discrete units of work produced by goal decomposition.
//! They form a DAG via `dependencies` and move through the wave scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Status of a task in the execution pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is defined but dependencies not met
    Pending,
    /// Task is ready to be dispatched (dependencies met)
    Ready,
    /// Task has been handed to a worker
    Dispatched,
    /// Task completed and passed the quality gate
    Completed,
    /// Task failed past its retry limit
    Failed,
    /// Task was skipped because a dependency failed
    Skipped,
    /// Task was replaced by auto-split sub-tasks
    Decomposed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Dispatched => "dispatched",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Decomposed => "decomposed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "ready" => Some(Self::Ready),
            "dispatched" | "running" => Some(Self::Dispatched),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "decomposed" => Some(Self::Decomposed),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Decomposed
        )
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::Ready, Self::Skipped, Self::Decomposed],
            Self::Ready => &[Self::Dispatched, Self::Skipped, Self::Decomposed],
            Self::Dispatched => &[Self::Completed, Self::Failed, Self::Ready],
            // Rescue re-promotes a skipped task whose artifacts survived.
            Self::Skipped => &[Self::Ready],
            Self::Completed | Self::Failed | Self::Decomposed => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// What kind of work a task represents.
///
/// Drives the per-type quality gate configuration (acceptance threshold,
/// retry limit, auto-split trigger, artifact requirements).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Implement,
    Research,
    Review,
    Test,
    Refactor,
    Design,
    Fix,
    Integrate,
    Documentation,
}

impl Default for TaskType {
    fn default() -> Self {
        Self::Implement
    }
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Implement => "implement",
            Self::Research => "research",
            Self::Review => "review",
            Self::Test => "test",
            Self::Refactor => "refactor",
            Self::Design => "design",
            Self::Fix => "fix",
            Self::Integrate => "integrate",
            Self::Documentation => "documentation",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "implement" | "implementation" => Some(Self::Implement),
            "research" => Some(Self::Research),
            "review" => Some(Self::Review),
            "test" | "testing" => Some(Self::Test),
            "refactor" => Some(Self::Refactor),
            "design" => Some(Self::Design),
            "fix" | "fixup" => Some(Self::Fix),
            "integrate" | "integration" => Some(Self::Integrate),
            "documentation" | "docs" => Some(Self::Documentation),
            _ => None,
        }
    }

    pub fn all() -> &'static [TaskType] {
        &[
            Self::Implement,
            Self::Research,
            Self::Review,
            Self::Test,
            Self::Refactor,
            Self::Design,
            Self::Fix,
            Self::Integrate,
            Self::Documentation,
        ]
    }
}

/// Priority level for tasks.
///
/// Ordering is by urgency: `Critical` sorts before `Low`. The budget pool
/// scales per-child allocations by [`TaskPriority::budget_multiplier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// Numeric rank used for stable wave ordering (lower dispatches first).
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    /// Decomposition output uses a numeric 1..=3 priority scale.
    pub fn from_rank(rank: u8) -> Self {
        match rank {
            0 | 1 => Self::Critical,
            2 => Self::High,
            3 => Self::Normal,
            _ => Self::Low,
        }
    }

    /// Budget multiplier applied to the per-child cap.
    pub fn budget_multiplier(&self) -> f64 {
        match self {
            Self::Critical => 1.5,
            Self::High => 1.25,
            Self::Normal => 1.0,
            Self::Low => 0.75,
        }
    }
}

/// Classified failure bucket for a worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    RateLimit,
    Timeout,
    ContextOverflow,
    QualityRejection,
    GenericFailure,
    ToolError,
    Cancelled,
}

impl FailureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::ContextOverflow => "context_overflow",
            Self::QualityRejection => "quality_rejection",
            Self::GenericFailure => "generic_failure",
            Self::ToolError => "tool_error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Failure modes that qualify a repeatedly failing task for auto-split.
    pub fn is_splittable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ContextOverflow | Self::GenericFailure
        )
    }
}

/// A single unit of work in the swarm DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmTask {
    pub id: String,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Complexity estimate 1..=5; scales timeouts and gates auto-split.
    pub complexity: u8,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    /// Failure modes of past attempts, oldest first.
    #[serde(default)]
    pub failure_history: Vec<FailureMode>,
    /// Free-form acceptance criteria checked by the quality gate pre-flight.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Set when this task exists solely to repair another task's output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixes_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_instructions: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl SwarmTask {
    pub fn new(id: impl Into<String>, description: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            task_type,
            complexity: 3,
            dependencies: Vec::new(),
            target_files: Vec::new(),
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            attempts: 0,
            failure_history: Vec::new(),
            acceptance_criteria: Vec::new(),
            fixes_task_id: None,
            fix_instructions: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Create a fixup task that depends on (and repairs) `fixes_task_id`.
    pub fn fixup(
        id: impl Into<String>,
        fixes_task_id: impl Into<String>,
        instructions: impl Into<String>,
        target_files: Vec<String>,
    ) -> Self {
        let fixes = fixes_task_id.into();
        let instructions = instructions.into();
        let mut task = Self::new(id, instructions.clone(), TaskType::Fix);
        task.dependencies = vec![fixes.clone()];
        task.target_files = target_files;
        task.fixes_task_id = Some(fixes);
        task.fix_instructions = Some(instructions);
        task
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_target_files(mut self, files: Vec<String>) -> Self {
        self.target_files = files;
        self
    }

    pub fn with_complexity(mut self, complexity: u8) -> Self {
        self.complexity = complexity.clamp(1, 5);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_fixup(&self) -> bool {
        self.fixes_task_id.is_some()
    }

    /// The two most recent failure modes, newest last.
    pub fn recent_failures(&self) -> &[FailureMode] {
        let len = self.failure_history.len();
        &self.failure_history[len.saturating_sub(2)..]
    }
}

/// Outcome of a single worker run on a task, after classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmTaskResult {
    pub task_id: String,
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
    #[serde(default)]
    pub accepted_with_degradation: bool,
}

impl SwarmTaskResult {
    pub fn failure(task_id: impl Into<String>, mode: FailureMode, response: String) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            response,
            artifacts_changed: Vec::new(),
            tokens_used: 0,
            cost_usd: 0.0,
            duration_ms: 0,
            failure_mode: Some(mode),
            accepted_with_degradation: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Ready));
        assert!(TaskStatus::Ready.can_transition_to(TaskStatus::Dispatched));
        assert!(TaskStatus::Dispatched.can_transition_to(TaskStatus::Ready)); // retry
        assert!(TaskStatus::Skipped.can_transition_to(TaskStatus::Ready)); // rescue
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Ready));
        assert!(!TaskStatus::Decomposed.can_transition_to(TaskStatus::Dispatched));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(TaskStatus::Decomposed.is_terminal());
        assert!(!TaskStatus::Dispatched.is_terminal());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical < TaskPriority::Normal);
        assert!(TaskPriority::Critical.rank() < TaskPriority::Low.rank());
        assert!((TaskPriority::Critical.budget_multiplier() - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fixup_constructor() {
        let fixup = SwarmTask::fixup("fixup-w0-0", "t1", "fix the tests", vec!["a.py".into()]);
        assert!(fixup.is_fixup());
        assert_eq!(fixup.dependencies, vec!["t1".to_string()]);
        assert_eq!(fixup.task_type, TaskType::Fix);
        assert_eq!(fixup.fixes_task_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_recent_failures_window() {
        let mut task = SwarmTask::new("t1", "work", TaskType::Implement);
        assert!(task.recent_failures().is_empty());
        task.failure_history.push(FailureMode::RateLimit);
        task.failure_history.push(FailureMode::Timeout);
        task.failure_history.push(FailureMode::Timeout);
        assert_eq!(
            task.recent_failures(),
            &[FailureMode::Timeout, FailureMode::Timeout]
        );
    }

    #[test]
    fn test_task_type_roundtrip() {
        for t in TaskType::all() {
            assert_eq!(TaskType::from_str(t.as_str()), Some(*t));
        }
    }

    #[test]
    fn test_serde_type_field_rename() {
        let task = SwarmTask::new("t1", "build it", TaskType::Implement);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "implement");
    }
}
