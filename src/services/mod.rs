//! Application services for the codeswarm orchestrator.
//!
//! Leaves first: cancellation, events, economics, budget, ledger; then the
//! gate, recovery, queue, pool, critic; the orchestrator glues them.

pub mod budget_pool;
pub mod cancellation;
pub mod critic;
pub mod economics;
pub mod event_bus;
pub mod file_ledger;
pub mod orchestrator;
pub mod quality_gate;
pub mod recovery;
pub mod task_queue;
pub mod worker_pool;

pub use budget_pool::SharedBudgetPool;
pub use cancellation::{CancellationSource, CancellationToken};
pub use economics::{fingerprint, SharedEconomics};
pub use event_bus::{EventBus, EventBusConfig};
pub use file_ledger::{FileLedger, WriteAttempt};
pub use orchestrator::{SwarmOrchestrator, SwarmRunContext, WaveOutcome};
pub use quality_gate::{GateDecision, QualityGate};
pub use recovery::RecoveryState;
pub use task_queue::TaskQueue;
pub use worker_pool::{FailureClassifier, ModelHealthTracker, WorkerPool};
