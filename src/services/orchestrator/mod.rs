//! Swarm orchestrator: decompose, plan, execute waves, verify, synthesize.
//!
//! The orchestrator is a single cooperative task gluing the subsystems:
//!
//! - **lifecycle**: LLM-driven phases (decomposition, split, replan,
//!   verification, synthesis) and their fallbacks
//! - **execution**: the wave loop, completion handling, recovery hooks
//! - **checkpoint**: snapshot/restore and on-disk state artifacts

mod checkpoint;
mod execution;
mod lifecycle;

pub use execution::WaveOutcome;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::config::SwarmConfig;
use crate::domain::models::event::{SwarmEvent, SwarmEventPayload};
use crate::domain::models::plan::{
    RunReason, SwarmExecutionResult, SwarmExecutionStats, SwarmPhase, SwarmStatus,
    VerificationResult,
};
use crate::domain::models::task::TaskStatus;
use crate::domain::ports::provider::Provider;
use crate::domain::ports::spawner::AgentSpawner;
use crate::infrastructure::state::{RunManifest, StateStore};
use crate::services::budget_pool::SharedBudgetPool;
use crate::services::cancellation::CancellationSource;
use crate::services::economics::{EconomicsConfig, SharedEconomics};
use crate::services::event_bus::{EventBus, EventBusConfig};
use crate::services::file_ledger::FileLedger;
use crate::services::quality_gate::QualityGate;
use crate::services::recovery::RecoveryState;
use crate::services::task_queue::TaskQueue;
use crate::services::worker_pool::{ModelHealthTracker, WorkerPool};

/// Shared services for one run, passed through constructors instead of
/// living in process-global state.
#[derive(Clone)]
pub struct SwarmRunContext {
    pub config: Arc<SwarmConfig>,
    pub event_bus: Arc<EventBus>,
    pub economics: Arc<SharedEconomics>,
    pub budget: Arc<SharedBudgetPool>,
    pub ledger: Arc<FileLedger>,
    pub recovery: Arc<RecoveryState>,
    pub health: Arc<ModelHealthTracker>,
}

impl SwarmRunContext {
    /// Build the context for a run rooted at `working_dir`.
    pub fn new(config: Arc<SwarmConfig>, working_dir: impl Into<std::path::PathBuf>) -> Self {
        let persist_path = config
            .run_root
            .as_ref()
            .filter(|_| config.persist_events)
            .map(|root| {
                // The sink opens eagerly; make sure the run root exists.
                if let Err(e) = std::fs::create_dir_all(root) {
                    warn!(root = %root.display(), error = %e, "cannot create run root");
                }
                StateStore::new(root).events_path()
            });
        let event_bus = Arc::new(EventBus::new(EventBusConfig {
            persist_path,
            ..EventBusConfig::default()
        }));
        let ledger = Arc::new(FileLedger::new(working_dir).with_event_bus(event_bus.clone()));
        Self {
            economics: Arc::new(SharedEconomics::new(EconomicsConfig {
                global_doom_threshold: config.global_doom_threshold,
            })),
            budget: Arc::new(SharedBudgetPool::new(config.budget)),
            recovery: Arc::new(RecoveryState::new(config.recovery, config.max_auto_splits)),
            health: Arc::new(ModelHealthTracker::default()),
            ledger,
            event_bus,
            config,
        }
    }
}

/// The main swarm orchestrator.
pub struct SwarmOrchestrator {
    pub(super) ctx: SwarmRunContext,
    pub(super) provider: Arc<dyn Provider>,
    pub(super) pool: WorkerPool,
    pub(super) gate: QualityGate,
    pub(super) queue: Mutex<TaskQueue>,
    pub(super) phase: StdMutex<SwarmPhase>,
    pub(super) cancel_source: CancellationSource,
    pub(super) run_id: Uuid,
    pub(super) goal: StdMutex<String>,
    pub(super) state_store: Option<StateStore>,
    pub(super) verification: Mutex<Vec<VerificationResult>>,
}

impl SwarmOrchestrator {
    pub fn new(
        ctx: SwarmRunContext,
        provider: Arc<dyn Provider>,
        spawner: Arc<dyn AgentSpawner>,
    ) -> Self {
        let pool = WorkerPool::new(
            ctx.config.clone(),
            spawner,
            ctx.event_bus.clone(),
            ctx.ledger.clone(),
            ctx.health.clone(),
        );
        let gate = QualityGate::new(ctx.config.clone(), ctx.ledger.root())
            .with_provider(provider.clone());
        let queue = Mutex::new(TaskQueue::new(ctx.config.conflict_strategy));
        let state_store = ctx.config.run_root.as_ref().map(StateStore::new);

        // Ledger write conflicts feed the per-path escalation streaks;
        // successful writes reset them. The pool only ever reaches the
        // orchestrator through the bus, never by direct reference.
        {
            let recovery = ctx.recovery.clone();
            ctx.event_bus.subscribe(Arc::new(move |event| {
                match &event.payload {
                    SwarmEventPayload::Conflict { path, .. } => {
                        recovery.record_conflict(path);
                    }
                    SwarmEventPayload::Write { path, .. } => {
                        recovery.clear_conflicts(path);
                    }
                    _ => {}
                }
            }));
        }

        Self {
            provider,
            pool,
            gate,
            queue,
            phase: StdMutex::new(SwarmPhase::Idle),
            cancel_source: CancellationSource::new_root(),
            run_id: Uuid::new_v4(),
            goal: StdMutex::new(String::new()),
            state_store,
            verification: Mutex::new(Vec::new()),
            ctx,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.ctx.event_bus
    }

    pub fn economics(&self) -> &Arc<SharedEconomics> {
        &self.ctx.economics
    }

    /// Request cancellation of the whole run tree.
    pub fn cancel(&self, reason: impl AsRef<str>) {
        self.cancel_source.cancel(reason.as_ref());
    }

    pub fn phase(&self) -> SwarmPhase {
        *self.lock_phase()
    }

    fn lock_phase(&self) -> std::sync::MutexGuard<'_, SwarmPhase> {
        match self.phase.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(super) fn set_phase(&self, phase: SwarmPhase) {
        *self.lock_phase() = phase;
        self.ctx.event_bus.emit(SwarmEvent::new(
            SwarmEventPayload::Phase {
                phase: phase.as_str().to_string(),
            },
            format!("phase: {}", phase.as_str()),
        ));
    }

    /// Live snapshot of the whole swarm.
    pub async fn status(&self) -> SwarmStatus {
        let queue = self.queue.lock().await;
        SwarmStatus {
            phase: self.phase(),
            current_wave: queue.current_wave(),
            total_waves: queue.total_waves(),
            queue: queue.stats(),
            workers: self.pool.statuses(),
            budget: self.ctx.budget.stats(),
        }
    }

    /// Run the swarm against a goal.
    ///
    /// Configuration errors and invariant violations are fatal and surface
    /// as `Err`; every other outcome (including cancellation and budget
    /// exhaustion) returns a [`SwarmExecutionResult`] with partial outcomes.
    pub async fn run(&self, goal: &str) -> SwarmResult<SwarmExecutionResult> {
        let started = Instant::now();
        {
            let mut stored = match self.goal.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            stored.clear();
            stored.push_str(goal);
        }

        // Phase: decomposing.
        self.set_phase(SwarmPhase::Decomposing);
        let tasks = match self.decompose(goal).await {
            Ok(tasks) => tasks,
            Err(e) if matches!(e, SwarmError::Cancelled(_)) => {
                return Ok(self.build_result(false, RunReason::Cancelled, started).await);
            }
            Err(e) => return Err(e),
        };

        if tasks.is_empty() {
            info!("decomposition produced no tasks; nothing to do");
            self.set_phase(SwarmPhase::Completed);
            let mut result = self.build_result(true, RunReason::Empty, started).await;
            result.summary = "Decomposition produced no subtasks.".to_string();
            return Ok(result);
        }

        // Phase: planning. Cycle or reference errors here are configuration
        // errors: fatal, nothing queued.
        self.set_phase(SwarmPhase::Planning);
        let task_count = tasks.len();
        {
            let mut queue = self.queue.lock().await;
            queue.ingest(tasks)?;
        }
        self.ctx.budget.set_expected_children(task_count);
        if let Some(store) = &self.state_store {
            store.ensure_layout().await?;
            let manifest = RunManifest::for_run(self.run_id, goal, &self.ctx.config, task_count);
            if let Err(e) = store.write_manifest(&manifest).await {
                warn!(error = %e, "failed to write run manifest");
            }
        }

        // Phase: executing.
        self.set_phase(SwarmPhase::Executing);
        let outcome = self.run_waves().await?;
        self.checkpoint_to_store().await;

        match outcome {
            WaveOutcome::Cancelled => {
                self.set_phase(SwarmPhase::Failed);
                return Ok(self.build_result(false, RunReason::Cancelled, started).await);
            }
            WaveOutcome::BudgetExhausted => {
                self.set_phase(SwarmPhase::Failed);
                return Ok(self.build_result(false, RunReason::Budget, started).await);
            }
            WaveOutcome::Stalled => {
                // One replan has already been spent; give up on what's left.
                warn!("queue stalled with pending work; skipping remaining tasks");
                self.skip_unreachable_tasks().await;
            }
            WaveOutcome::Completed => {}
        }

        // Phase: verifying (advisory; never revokes granted acceptance).
        if self.ctx.config.verification_enabled {
            self.set_phase(SwarmPhase::Verifying);
            let results = self.verify_completed_tasks().await;
            *self.verification.lock().await = results;
        }

        // Phase: synthesizing.
        self.set_phase(SwarmPhase::Synthesizing);
        let summary = self.synthesize().await;

        let failed = {
            let queue = self.queue.lock().await;
            queue.stats().failed
        };
        let success = failed == 0;
        let reason = if success {
            RunReason::Completed
        } else {
            RunReason::FailedTasks
        };
        self.set_phase(if success {
            SwarmPhase::Completed
        } else {
            SwarmPhase::Failed
        });

        let mut result = self.build_result(success, reason, started).await;
        result.summary = summary;
        self.checkpoint_to_store().await;
        Ok(result)
    }

    /// Tasks that can no longer run (stalled queue) become skipped.
    async fn skip_unreachable_tasks(&self) {
        let mut queue = self.queue.lock().await;
        let ids: Vec<String> = queue
            .tasks()
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Ready))
            .map(|t| t.id.clone())
            .collect();
        for id in ids {
            // Direct status flip: the dependency that would unblock these is
            // never coming.
            if let Some(task) = queue.get(&id) {
                let cause = task
                    .dependencies
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "stall".to_string());
                let _ = queue.force_skip(&id);
                self.ctx.event_bus.emit(
                    SwarmEvent::new(
                        SwarmEventPayload::Skip {
                            cause_task_id: cause,
                        },
                        format!("{id} skipped: queue stalled"),
                    )
                    .for_task(id),
                );
            }
        }
    }

    async fn build_result(
        &self,
        success: bool,
        reason: RunReason,
        started: Instant,
    ) -> SwarmExecutionResult {
        let queue = self.queue.lock().await;
        let stats = queue.stats();
        let budget = self.ctx.budget.stats();

        let mut artifacts = Vec::new();
        let mut skipped_with_artifacts = Vec::new();
        let mut degraded = 0usize;
        let mut total_cost = 0.0;
        let mut task_results = Vec::new();
        for task in queue.tasks() {
            if let Some(result) = queue.result(&task.id) {
                total_cost += result.cost_usd;
                if result.accepted_with_degradation {
                    degraded += 1;
                }
                let bucket = match task.status {
                    TaskStatus::Completed => Some(&mut artifacts),
                    TaskStatus::Skipped => Some(&mut skipped_with_artifacts),
                    _ => None,
                };
                if let Some(bucket) = bucket {
                    for artifact in &result.artifacts_changed {
                        if !bucket.contains(artifact) {
                            bucket.push(artifact.clone());
                        }
                    }
                }
                task_results.push(result.clone());
            }
        }

        let verification = self.verification.lock().await.clone();
        SwarmExecutionResult {
            success,
            reason,
            task_results,
            stats: SwarmExecutionStats {
                total_tasks: stats.total(),
                completed: stats.completed,
                failed: stats.failed,
                skipped: stats.skipped,
                degraded,
                waves: queue.current_wave(),
                total_tokens: budget.used + budget.parent_used,
                total_cost_usd: total_cost,
            },
            artifacts,
            skipped_with_artifacts,
            verification,
            summary: String::new(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}
