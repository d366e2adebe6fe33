//! Domain models for the codeswarm orchestrator.

pub mod budget;
pub mod config;
pub mod dag;
pub mod event;
pub mod ledger;
pub mod plan;
pub mod task;
pub mod worker;

pub use budget::{BudgetAllocation, BudgetPoolConfig, BudgetPoolStats};
pub use config::{FileConflictStrategy, RecoveryConfig, SwarmConfig, TaskTypeConfig};
pub use dag::{DependencyGraph, DependencyNode};
pub use event::{SwarmEvent, SwarmEventPayload};
pub use ledger::{FileClaim, FileVersion, WriteResult};
pub use plan::{
    BudgetPoolSnapshot, EconomicsSnapshot, QueueSnapshot, RunReason, SmartDecompositionResult,
    SmartSubtask, SwarmCheckpoint, SwarmExecutionResult, SwarmExecutionStats, SwarmPhase,
    SwarmQueueStats, SwarmStatus, VerificationResult,
};
pub use task::{FailureMode, SwarmTask, SwarmTaskResult, TaskPriority, TaskStatus, TaskType};
pub use worker::{
    ModelHealthRecord, SwarmWorkerSpec, SwarmWorkerStatus, WorkerCapability, WorkerRole,
    WorkerState,
};
