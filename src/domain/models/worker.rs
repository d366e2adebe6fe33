//! Worker roster and health domain models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::task::TaskType;

/// High-level role of a worker spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Coder,
    Researcher,
    Reviewer,
    Tester,
    Designer,
}

impl WorkerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coder => "coder",
            Self::Researcher => "researcher",
            Self::Reviewer => "reviewer",
            Self::Tester => "tester",
            Self::Designer => "designer",
        }
    }
}

/// A capability a worker advertises and a task may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerCapability {
    Coding,
    Research,
    Review,
    Testing,
    Design,
    Refactoring,
    Documentation,
    Integration,
}

impl WorkerCapability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coding => "coding",
            Self::Research => "research",
            Self::Review => "review",
            Self::Testing => "testing",
            Self::Design => "design",
            Self::Refactoring => "refactoring",
            Self::Documentation => "documentation",
            Self::Integration => "integration",
        }
    }

    /// Parse a capability, accepting the common config-file aliases.
    pub fn parse_alias(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "coding" | "code" | "implement" => Some(Self::Coding),
            "research" | "analysis" => Some(Self::Research),
            "review" | "code-review" => Some(Self::Review),
            "testing" | "test" | "tests" => Some(Self::Testing),
            "design" | "architecture" => Some(Self::Design),
            "refactoring" | "refactor" => Some(Self::Refactoring),
            "documentation" | "docs" => Some(Self::Documentation),
            "integration" | "integrate" => Some(Self::Integration),
            _ => None,
        }
    }

    /// Capabilities a task of the given type requires from its worker.
    pub fn required_for(task_type: TaskType) -> BTreeSet<Self> {
        let caps: &[Self] = match task_type {
            TaskType::Implement | TaskType::Fix => &[Self::Coding],
            TaskType::Research => &[Self::Research],
            TaskType::Review => &[Self::Review],
            TaskType::Test => &[Self::Testing, Self::Coding],
            TaskType::Refactor => &[Self::Refactoring, Self::Coding],
            TaskType::Design => &[Self::Design],
            TaskType::Integrate => &[Self::Integration, Self::Coding],
            TaskType::Documentation => &[Self::Documentation],
        };
        caps.iter().copied().collect()
    }
}

/// Static description of a worker the pool may spawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmWorkerSpec {
    pub worker_id: String,
    pub model: String,
    pub role: WorkerRole,
    /// Ordered set so selection scoring is deterministic.
    pub capabilities: BTreeSet<WorkerCapability>,
    pub max_concurrency: usize,
}

impl SwarmWorkerSpec {
    pub fn new(
        worker_id: impl Into<String>,
        model: impl Into<String>,
        role: WorkerRole,
        capabilities: impl IntoIterator<Item = WorkerCapability>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            model: model.into(),
            role,
            capabilities: capabilities.into_iter().collect(),
            max_concurrency: 1,
        }
    }

    /// Overlap score against a required capability set; `None` if the spec
    /// does not cover every required capability.
    pub fn match_score(&self, required: &BTreeSet<WorkerCapability>) -> Option<usize> {
        if required.is_subset(&self.capabilities) {
            // Tighter specs win: fewer surplus capabilities score higher.
            Some(
                (required.len() * 100)
                    .saturating_sub(self.capabilities.len() - required.len()),
            )
        } else {
            None
        }
    }
}

/// Runtime state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Claiming,
    Running,
    Done,
    Error,
}

/// Live status row for one worker, as exposed in swarm snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmWorkerStatus {
    pub worker_id: String,
    pub status: WorkerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default)]
    pub tokens_used: u64,
}

/// Rolling health record for a model, fed by worker completions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelHealthRecord {
    pub model: String,
    pub successes: u64,
    pub failures: u64,
    pub rate_limits: u64,
    pub quality_rejections: u64,
    pub avg_latency_ms: f64,
    pub healthy: bool,
}

impl ModelHealthRecord {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            successes: 0,
            failures: 0,
            rate_limits: 0,
            quality_rejections: 0,
            avg_latency_ms: 0.0,
            healthy: true,
        }
    }

    /// Fraction of attempts that failed, 0.0 when untried.
    pub fn failure_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                self.failures as f64 / total as f64
            }
        }
    }
}
