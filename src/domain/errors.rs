//! Domain errors for the codeswarm orchestrator.

use thiserror::Error;

/// Domain-level errors that can occur during a swarm run.
///
/// Worker-side failures (rate limits, timeouts, context overflows) are data,
/// not errors: they travel as [`crate::domain::models::task::FailureMode`]
/// inside task results so recovery can act on them without unwinding.
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("Budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Provider error: {message}")]
    Provider {
        retryable: bool,
        status_code: Option<u16>,
        message: String,
    },

    #[error("Write conflict on {path}: base {base_hash} != current {current_hash}")]
    LedgerConflict {
        path: String,
        base_hash: String,
        current_hash: String,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task dependency cycle detected involving task: {0}")]
    DependencyCycle(String),

    #[error("Unknown dependency {dependency} referenced by task {task}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Invalid state transition from {from} to {to} for task {task}")]
    InvalidStateTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwarmError {
    /// Whether the orchestrator may absorb this error and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider { retryable: true, .. })
    }

    /// Fatal errors abort the run without a partial result.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::InvariantViolation(_))
    }
}

pub type SwarmResult<T> = Result<T, SwarmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_provider_error() {
        let err = SwarmError::Provider {
            retryable: true,
            status_code: Some(529),
            message: "overloaded".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(SwarmError::Configuration("bad".into()).is_fatal());
        assert!(SwarmError::InvariantViolation("bad".into()).is_fatal());
        assert!(!SwarmError::Cancelled("user".into()).is_fatal());
    }

    #[test]
    fn test_display_includes_path() {
        let err = SwarmError::LedgerConflict {
            path: "src/main.rs".into(),
            base_hash: "aaa".into(),
            current_hash: "bbb".into(),
        };
        assert!(err.to_string().contains("src/main.rs"));
    }
}
