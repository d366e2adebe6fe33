//! Worker pool: capability matching, per-task spawn, failure classification.
//!
//! Workers are spawned per task through the [`AgentSpawner`] port, gated by a
//! concurrency semaphore. Model health feeds selection tie-breaks; raw spawn
//! errors are bucketed by an extensible classifier.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::domain::models::config::SwarmConfig;
use crate::domain::models::event::{SwarmEvent, SwarmEventPayload};
use crate::domain::models::task::{FailureMode, SwarmTask, SwarmTaskResult};
use crate::domain::models::worker::{
    ModelHealthRecord, SwarmWorkerSpec, SwarmWorkerStatus, WorkerCapability, WorkerRole,
    WorkerState,
};
use crate::domain::ports::spawner::{AgentSpawner, WorkerSpawnSpec};
use crate::services::cancellation::CancellationToken;
use crate::services::event_bus::EventBus;
use crate::services::file_ledger::FileLedger;

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

/// One substring rule mapping raw error text to a failure bucket.
#[derive(Debug, Clone)]
pub struct ClassifierRule {
    pub needle: &'static str,
    pub mode: FailureMode,
}

/// Extensible raw-error classifier. Rules are checked in order; the first
/// match wins, and callers may push their own rules ahead of the defaults.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    rules: Vec<ClassifierRule>,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self {
            rules: vec![
                ClassifierRule { needle: "rate limit", mode: FailureMode::RateLimit },
                ClassifierRule { needle: "429", mode: FailureMode::RateLimit },
                ClassifierRule { needle: "too many requests", mode: FailureMode::RateLimit },
                ClassifierRule { needle: "overloaded", mode: FailureMode::RateLimit },
                ClassifierRule { needle: "timed out", mode: FailureMode::Timeout },
                ClassifierRule { needle: "timeout", mode: FailureMode::Timeout },
                ClassifierRule { needle: "context length", mode: FailureMode::ContextOverflow },
                ClassifierRule { needle: "context window", mode: FailureMode::ContextOverflow },
                ClassifierRule { needle: "token limit", mode: FailureMode::ContextOverflow },
                ClassifierRule { needle: "prompt is too long", mode: FailureMode::ContextOverflow },
                ClassifierRule { needle: "tool not found", mode: FailureMode::ToolError },
                ClassifierRule { needle: "unknown tool", mode: FailureMode::ToolError },
                ClassifierRule { needle: "cancelled", mode: FailureMode::Cancelled },
                ClassifierRule { needle: "canceled", mode: FailureMode::Cancelled },
            ],
        }
    }
}

impl FailureClassifier {
    /// Prepend a custom rule so it takes precedence over the defaults.
    pub fn with_rule(mut self, needle: &'static str, mode: FailureMode) -> Self {
        self.rules.insert(0, ClassifierRule { needle, mode });
        self
    }

    pub fn classify(&self, raw_error: &str) -> FailureMode {
        let lower = raw_error.to_lowercase();
        self.rules
            .iter()
            .find(|rule| lower.contains(rule.needle))
            .map_or(FailureMode::GenericFailure, |rule| rule.mode)
    }
}

// ---------------------------------------------------------------------------
// Model health
// ---------------------------------------------------------------------------

/// Unhealthy once at least this many attempts exist and half of them failed.
const HEALTH_MIN_SAMPLES: u64 = 3;
const HEALTH_FAILURE_RATE: f64 = 0.5;

/// Tracks per-model outcomes for selection tie-breaks and fallback rotation.
#[derive(Debug, Default)]
pub struct ModelHealthTracker {
    records: Mutex<HashMap<String, ModelHealthRecord>>,
}

impl ModelHealthTracker {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ModelHealthRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record_success(&self, model: &str, latency_ms: u64) {
        let mut records = self.lock();
        let record = records
            .entry(model.to_string())
            .or_insert_with(|| ModelHealthRecord::new(model));
        record.successes += 1;
        let total = record.successes + record.failures;
        #[allow(clippy::cast_precision_loss)]
        {
            record.avg_latency_ms +=
                (latency_ms as f64 - record.avg_latency_ms) / total as f64;
        }
        Self::refresh(record);
    }

    pub fn record_failure(&self, model: &str, mode: FailureMode) {
        let mut records = self.lock();
        let record = records
            .entry(model.to_string())
            .or_insert_with(|| ModelHealthRecord::new(model));
        record.failures += 1;
        match mode {
            FailureMode::RateLimit => record.rate_limits += 1,
            FailureMode::QualityRejection => record.quality_rejections += 1,
            _ => {}
        }
        Self::refresh(record);
    }

    fn refresh(record: &mut ModelHealthRecord) {
        let total = record.successes + record.failures;
        record.healthy = total < HEALTH_MIN_SAMPLES || record.failure_rate() < HEALTH_FAILURE_RATE;
    }

    pub fn failure_rate(&self, model: &str) -> f64 {
        self.lock().get(model).map_or(0.0, ModelHealthRecord::failure_rate)
    }

    pub fn is_healthy(&self, model: &str) -> bool {
        self.lock().get(model).is_none_or(|r| r.healthy)
    }

    pub fn get(&self, model: &str) -> Option<ModelHealthRecord> {
        self.lock().get(model).cloned()
    }

    pub fn all(&self) -> Vec<ModelHealthRecord> {
        let mut records: Vec<ModelHealthRecord> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.model.cmp(&b.model));
        records
    }

    /// Pick the first healthy alternative from `candidates` that differs from
    /// `current`; falls back to `current` when all are unhealthy.
    pub fn select_alternative<'a>(&self, current: &'a str, candidates: &'a [String]) -> &'a str {
        candidates
            .iter()
            .find(|m| m.as_str() != current && self.is_healthy(m))
            .map_or(current, String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Fallback roster and prompt assembly
// ---------------------------------------------------------------------------

/// Deterministic fallback roster used when the config names no workers or no
/// spec covers a task's capabilities.
pub fn fallback_workers(default_model: &str) -> Vec<SwarmWorkerSpec> {
    vec![
        SwarmWorkerSpec::new(
            "fallback-coder",
            default_model,
            WorkerRole::Coder,
            [
                WorkerCapability::Coding,
                WorkerCapability::Refactoring,
                WorkerCapability::Integration,
                WorkerCapability::Testing,
                WorkerCapability::Documentation,
            ],
        ),
        SwarmWorkerSpec::new(
            "fallback-researcher",
            default_model,
            WorkerRole::Researcher,
            [WorkerCapability::Research, WorkerCapability::Design],
        ),
        SwarmWorkerSpec::new(
            "fallback-reviewer",
            default_model,
            WorkerRole::Reviewer,
            [WorkerCapability::Review],
        ),
    ]
}

/// Build the per-attempt system prompt.
///
/// Attempt 1 is short; attempt 2 adds failure evidence; attempt 3 and later
/// also directs the worker to change its approach.
pub fn build_system_prompt(task: &SwarmTask, spec: &SwarmWorkerSpec, budget_tokens: u64) -> String {
    let mut prompt = format!(
        "You are a {} agent in a coding swarm. Complete this task fully, then stop.\n\
         Task: {}\nType: {}\nToken budget: {}\n",
        spec.role.as_str(),
        task.description,
        task.task_type.as_str(),
        budget_tokens,
    );
    if !task.target_files.is_empty() {
        prompt.push_str(&format!("Target files: {}\n", task.target_files.join(", ")));
    }
    if let Some(instructions) = &task.fix_instructions {
        prompt.push_str(&format!("Fix instructions: {instructions}\n"));
    }
    if task.attempts >= 1 {
        let evidence: Vec<&str> = task
            .failure_history
            .iter()
            .map(FailureMode::as_str)
            .collect();
        prompt.push_str(&format!(
            "\nPrevious attempts failed ({}). Avoid repeating the same failure.\n",
            evidence.join(", ")
        ));
    }
    if task.attempts >= 2 {
        prompt.push_str(
            "This task has failed repeatedly. Try a different approach than before: \
             change strategy, simplify scope, or work in smaller steps.\n",
        );
    }
    prompt
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Concurrency-capped worker pool.
pub struct WorkerPool {
    config: Arc<SwarmConfig>,
    spawner: Arc<dyn AgentSpawner>,
    event_bus: Arc<EventBus>,
    ledger: Arc<FileLedger>,
    health: Arc<ModelHealthTracker>,
    classifier: FailureClassifier,
    semaphore: Arc<Semaphore>,
    statuses: Mutex<HashMap<String, SwarmWorkerStatus>>,
    working_dir: PathBuf,
}

impl WorkerPool {
    pub fn new(
        config: Arc<SwarmConfig>,
        spawner: Arc<dyn AgentSpawner>,
        event_bus: Arc<EventBus>,
        ledger: Arc<FileLedger>,
        health: Arc<ModelHealthTracker>,
    ) -> Self {
        let max = config.max_workers.max(1);
        let working_dir = ledger.root().to_path_buf();
        Self {
            config,
            spawner,
            event_bus,
            ledger,
            health,
            classifier: FailureClassifier::default(),
            semaphore: Arc::new(Semaphore::new(max)),
            statuses: Mutex::new(HashMap::new()),
            working_dir,
        }
    }

    /// Replace the failure classifier (e.g. with adapter-specific rules).
    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn classifier(&self) -> &FailureClassifier {
        &self.classifier
    }

    pub fn health(&self) -> &Arc<ModelHealthTracker> {
        &self.health
    }

    /// Select the best-matching worker spec for a task: capability superset
    /// with the highest match score, ties broken by lower recent failure
    /// rate, then by worker id. Falls through to the fallback roster.
    pub fn select_worker(&self, task: &SwarmTask) -> SwarmWorkerSpec {
        let required = WorkerCapability::required_for(task.task_type);

        let pick = |specs: &[SwarmWorkerSpec]| -> Option<SwarmWorkerSpec> {
            let mut matching: Vec<(&SwarmWorkerSpec, usize)> = specs
                .iter()
                .filter_map(|s| s.match_score(&required).map(|score| (s, score)))
                .collect();
            matching.sort_by(|(a, score_a), (b, score_b)| {
                score_b
                    .cmp(score_a)
                    .then_with(|| {
                        self.health
                            .failure_rate(&a.model)
                            .partial_cmp(&self.health.failure_rate(&b.model))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| a.worker_id.cmp(&b.worker_id))
            });
            matching.first().map(|(s, _)| (*s).clone())
        };

        if let Some(spec) = pick(&self.config.workers) {
            return spec;
        }
        let fallbacks = fallback_workers(&self.config.default_worker_model);
        pick(&fallbacks).unwrap_or_else(|| fallbacks[0].clone())
    }

    /// Current status rows, worker id order.
    pub fn statuses(&self) -> Vec<SwarmWorkerStatus> {
        let statuses = match self.statuses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut rows: Vec<SwarmWorkerStatus> = statuses.values().cloned().collect();
        rows.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        rows
    }

    fn set_status(&self, agent_id: &str, state: WorkerState, task_id: Option<&str>, tokens: u64) {
        let mut statuses = match self.statuses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = statuses
            .entry(agent_id.to_string())
            .or_insert_with(|| SwarmWorkerStatus {
                worker_id: agent_id.to_string(),
                status: WorkerState::Idle,
                task_id: None,
                started_at: None,
                elapsed_ms: 0,
                tokens_used: 0,
            });
        entry.status = state;
        entry.task_id = task_id.map(String::from);
        entry.tokens_used = tokens;
        match state {
            WorkerState::Claiming => entry.started_at = Some(Utc::now()),
            WorkerState::Done | WorkerState::Error => {
                if let Some(started) = entry.started_at {
                    entry.elapsed_ms =
                        u64::try_from((Utc::now() - started).num_milliseconds().max(0))
                            .unwrap_or(0);
                }
            }
            _ => {}
        }
    }

    /// Run one task to completion on the given spec.
    ///
    /// Acquires a concurrency permit, publishes `spawn` and `claim` events,
    /// invokes the spawner under the complexity-scaled timeout, and returns a
    /// classified [`SwarmTaskResult`]. Acceptance events are the
    /// orchestrator's concern.
    pub async fn run_task(
        &self,
        task: &SwarmTask,
        spec: &SwarmWorkerSpec,
        budget_tokens: u64,
        cancel: CancellationToken,
    ) -> SwarmTaskResult {
        let agent_id = format!("{}:{}", spec.worker_id, task.id);

        let Ok(_permit) = self.semaphore.acquire().await else {
            return SwarmTaskResult::failure(
                &task.id,
                FailureMode::Cancelled,
                "worker pool shut down".to_string(),
            );
        };

        self.set_status(&agent_id, WorkerState::Claiming, Some(&task.id), 0);
        self.event_bus.emit(
            SwarmEvent::new(
                SwarmEventPayload::Spawn {
                    worker_id: spec.worker_id.clone(),
                    model: spec.model.clone(),
                    attempt: task.attempts + 1,
                },
                format!("spawning {} for {}", spec.worker_id, task.id),
            )
            .for_task(task.id.clone())
            .for_agent(agent_id.clone()),
        );

        // Claim declared target files before the worker starts.
        for path in &task.target_files {
            if self.ledger.claim(path, &agent_id, &task.id).await {
                self.event_bus.emit(
                    SwarmEvent::new(
                        SwarmEventPayload::Claim { path: path.clone() },
                        format!("{agent_id} claimed {path}"),
                    )
                    .for_task(task.id.clone())
                    .for_agent(agent_id.clone()),
                );
            } else {
                self.ledger.release_all(&agent_id).await;
                self.set_status(&agent_id, WorkerState::Error, Some(&task.id), 0);
                warn!(task = %task.id, path, "file claim conflict; task will retry");
                return SwarmTaskResult::failure(
                    &task.id,
                    FailureMode::GenericFailure,
                    format!("file claim conflict on {path}"),
                );
            }
        }

        self.set_status(&agent_id, WorkerState::Running, Some(&task.id), 0);
        let spawn_spec = WorkerSpawnSpec {
            task: task.clone(),
            system_prompt: build_system_prompt(task, spec, budget_tokens),
            budget_tokens,
            capabilities: spec.capabilities.clone(),
            model: spec.model.clone(),
            working_dir: self.working_dir.clone(),
            ledger: self.ledger.clone(),
            cancel: cancel.clone(),
        };

        let timeout = Duration::from_millis(self.config.task_timeout_ms(task.complexity));
        let started = std::time::Instant::now();
        let outcome = tokio::select! {
            result = self.spawner.spawn(spawn_spec) => Some(result),
            () = cancel.wait() => None,
            () = tokio::time::sleep(timeout) => {
                debug!(task = %task.id, timeout_ms = timeout.as_millis() as u64, "worker timed out");
                Some(crate::domain::ports::spawner::SpawnResult {
                    success: false,
                    failure_mode: Some(FailureMode::Timeout),
                    raw_error: Some(format!("worker timed out after {} ms", timeout.as_millis())),
                    duration_ms: timeout.as_millis() as u64,
                    ..Default::default()
                })
            }
        };

        self.ledger.release_all(&agent_id).await;

        let result = match outcome {
            None => SwarmTaskResult::failure(
                &task.id,
                FailureMode::Cancelled,
                cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
            ),
            Some(spawn) => self.classify_result(task, spawn, started.elapsed()),
        };

        if result.success {
            self.health.record_success(&spec.model, result.duration_ms);
            self.set_status(&agent_id, WorkerState::Done, Some(&task.id), result.tokens_used);
        } else {
            let mode = result.failure_mode.unwrap_or(FailureMode::GenericFailure);
            self.health.record_failure(&spec.model, mode);
            self.set_status(&agent_id, WorkerState::Error, Some(&task.id), result.tokens_used);
            if mode == FailureMode::RateLimit {
                self.event_bus.emit(
                    SwarmEvent::new(
                        SwarmEventPayload::RateLimit {
                            model: spec.model.clone(),
                        },
                        format!("{} rate limited", spec.model),
                    )
                    .for_task(task.id.clone())
                    .for_agent(agent_id),
                );
            }
        }

        result
    }

    fn classify_result(
        &self,
        task: &SwarmTask,
        spawn: crate::domain::ports::spawner::SpawnResult,
        elapsed: Duration,
    ) -> SwarmTaskResult {
        let duration_ms = if spawn.duration_ms > 0 {
            spawn.duration_ms
        } else {
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
        };
        let failure_mode = if spawn.success {
            None
        } else {
            Some(spawn.failure_mode.unwrap_or_else(|| {
                self.classifier
                    .classify(spawn.raw_error.as_deref().unwrap_or(""))
            }))
        };
        SwarmTaskResult {
            task_id: task.id.clone(),
            success: spawn.success,
            response: spawn.response,
            artifacts_changed: spawn.artifacts_changed,
            tokens_used: spawn.tokens_used,
            cost_usd: spawn.cost_usd,
            duration_ms,
            failure_mode,
            accepted_with_degradation: false,
        }
    }
}
