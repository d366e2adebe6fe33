//! Wave execution loop: dispatch, completion handling, recovery hooks.

use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use crate::domain::errors::SwarmResult;
use crate::domain::models::budget::BudgetAllocation;
use crate::domain::models::config::TaskTypeConfig;
use crate::domain::models::event::{SwarmEvent, SwarmEventPayload};
use crate::domain::models::plan::SwarmPhase;
use crate::domain::models::task::{FailureMode, SwarmTask, SwarmTaskResult, TaskStatus};
use crate::domain::models::worker::SwarmWorkerSpec;
use crate::services::critic;

use super::SwarmOrchestrator;

/// Tagged outcome of the wave loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveOutcome {
    /// Every task reached a terminal state.
    Completed,
    /// The run was cancelled mid-execution.
    Cancelled,
    /// The budget pool can no longer fund a worker.
    BudgetExhausted,
    /// Pending work remains but nothing can become ready.
    Stalled,
}

/// How one completion was absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Accepted,
    Retried,
    Split,
    Failed,
}

impl SwarmOrchestrator {
    /// The outer wave loop. Runs until the queue drains, the budget dies,
    /// the run is cancelled, or the queue stalls past recovery.
    pub(super) async fn run_waves(&self) -> SwarmResult<WaveOutcome> {
        let cancel = self.cancel_source.token();
        let mut stalled_ticks: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(WaveOutcome::Cancelled);
            }

            // Honor an active circuit breaker before any dispatch.
            if let Some(remaining) = self.ctx.recovery.circuit_breaker_remaining() {
                self.ctx.event_bus.emit(SwarmEvent::new(
                    SwarmEventPayload::CircuitBreaker {
                        active: true,
                        pause_ms: self.ctx.recovery.pause_ms(),
                    },
                    "circuit breaker active; pausing dispatch",
                ));
                tokio::select! {
                    () = tokio::time::sleep(remaining) => {}
                    () = cancel.wait() => return Ok(WaveOutcome::Cancelled),
                }
                self.ctx.event_bus.emit(SwarmEvent::new(
                    SwarmEventPayload::CircuitBreaker {
                        active: false,
                        pause_ms: 0,
                    },
                    "circuit breaker cleared; dispatch resumes",
                ));
                continue;
            }

            let selection = {
                let mut queue = self.queue.lock().await;
                queue.next_wave(self.ctx.config.max_workers)
            };

            // First-wins losers were already skipped by the queue.
            for conflict in &selection.conflicts {
                self.ctx.event_bus.emit(
                    SwarmEvent::new(
                        SwarmEventPayload::Conflict {
                            path: conflict.path.clone(),
                            base_hash: String::new(),
                            current_hash: String::new(),
                        },
                        format!(
                            "{} lost {} to {}",
                            conflict.task_id, conflict.path, conflict.winner_task_id
                        ),
                    )
                    .for_task(conflict.task_id.clone()),
                );
                self.ctx.event_bus.emit(
                    SwarmEvent::new(
                        SwarmEventPayload::Skip {
                            cause_task_id: conflict.winner_task_id.clone(),
                        },
                        format!("{} skipped on file conflict", conflict.task_id),
                    )
                    .for_task(conflict.task_id.clone()),
                );
            }

            if selection.tasks.is_empty() {
                let (stats, has_work) = {
                    let queue = self.queue.lock().await;
                    (queue.stats(), queue.has_pending_work())
                };
                if !has_work {
                    return Ok(WaveOutcome::Completed);
                }

                stalled_ticks += 1;
                if self.rescue_skipped().await > 0 {
                    stalled_ticks = 0;
                    continue;
                }
                if self
                    .ctx
                    .recovery
                    .try_arm_replan(stats.pending, stats.ready, stalled_ticks)
                {
                    self.set_phase(SwarmPhase::Replanning);
                    let replanned = self.replan().await;
                    self.set_phase(SwarmPhase::Executing);
                    if replanned {
                        stalled_ticks = 0;
                        continue;
                    }
                }
                if stalled_ticks > self.ctx.config.recovery.stall_ticks_before_replan {
                    return Ok(WaveOutcome::Stalled);
                }
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(50)) => {}
                    () = cancel.wait() => return Ok(WaveOutcome::Cancelled),
                }
                continue;
            }

            match self.run_one_wave(selection.wave_index, selection.tasks).await? {
                Some(outcome) => return Ok(outcome),
                None => stalled_ticks = 0,
            }
        }
    }

    /// Dispatch one wave and absorb its completions. Returns a terminal
    /// outcome, or `None` to continue with the next wave.
    async fn run_one_wave(
        &self,
        wave_index: usize,
        tasks: Vec<SwarmTask>,
    ) -> SwarmResult<Option<WaveOutcome>> {
        let cancel = self.cancel_source.token();

        // Fund and mark each member; unfunded tasks stay ready (parked).
        let mut dispatched: Vec<(SwarmTask, SwarmWorkerSpec, BudgetAllocation)> = Vec::new();
        for task in tasks {
            let spec = self.pool.select_worker(&task);
            match self
                .ctx
                .budget
                .allocate(&spec.worker_id, &task.id, task.priority)
            {
                Some(allocation) => {
                    {
                        let mut queue = self.queue.lock().await;
                        queue.mark_dispatched(&task.id)?;
                    }
                    self.emit_budget_event(&task.id, allocation.allocated_tokens, 0);
                    dispatched.push((task, spec, allocation));
                }
                None => {
                    debug!(task = %task.id, "budget allocation refused; parking task");
                }
            }
        }

        if dispatched.is_empty() {
            if self.ctx.budget.is_exhausted() {
                return Ok(Some(WaveOutcome::BudgetExhausted));
            }
            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(50)) => {}
                () = cancel.wait() => return Ok(Some(WaveOutcome::Cancelled)),
            }
            return Ok(None);
        }

        self.ctx.event_bus.emit(SwarmEvent::new(
            SwarmEventPayload::WaveStart {
                wave: wave_index,
                task_count: dispatched.len(),
            },
            format!("wave {} starting with {} tasks", wave_index, dispatched.len()),
        ));

        // Workers share a wave-scoped cancellation child; a wave timeout
        // cancels stragglers without killing the run.
        let wave_source = self.cancel_source.create_linked();
        let stagger_ms = self.ctx.recovery.stagger_ms();
        let wave_timeout_ms = dispatched
            .iter()
            .map(|(t, _, _)| self.ctx.config.task_timeout_ms(t.complexity))
            .max()
            .unwrap_or(self.ctx.config.base_timeout_ms)
            + self.ctx.config.wave_timeout_slack_ms;

        let mut in_flight = FuturesUnordered::new();
        for (i, (task, spec, allocation)) in dispatched.into_iter().enumerate() {
            let token = wave_source.token();
            let delay = Duration::from_millis(stagger_ms * i as u64);
            in_flight.push(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let result = self
                    .pool
                    .run_task(&task, &spec, allocation.allocated_tokens, token)
                    .await;
                (task, spec, allocation, result)
            });
        }

        let deadline = tokio::time::sleep(Duration::from_millis(wave_timeout_ms));
        tokio::pin!(deadline);
        let mut deadline_armed = true;
        let mut cancel_armed = true;
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut wave_results: Vec<(String, bool)> = Vec::new();

        loop {
            tokio::select! {
                next = in_flight.next() => {
                    let Some((task, spec, allocation, result)) = next else { break };
                    let disposition = self
                        .handle_completion(&task, &spec, allocation, result)
                        .await?;
                    match disposition {
                        Disposition::Accepted => {
                            succeeded += 1;
                            wave_results.push((task.id.clone(), true));
                        }
                        Disposition::Failed => {
                            failed += 1;
                            wave_results.push((task.id.clone(), false));
                        }
                        Disposition::Retried | Disposition::Split => {}
                    }
                }
                () = cancel.wait(), if cancel_armed => {
                    // Keep draining: completions after cancellation are still
                    // recorded, they just stop promoting downstream work.
                    wave_source.cancel(cancel.reason().unwrap_or_else(|| "cancelled".to_string()));
                    cancel_armed = false;
                }
                () = &mut deadline, if deadline_armed => {
                    warn!(wave = wave_index, "wave timeout; cancelling stragglers");
                    wave_source.cancel("wave timeout");
                    deadline_armed = false;
                }
            }
        }

        self.ctx.event_bus.emit(SwarmEvent::new(
            SwarmEventPayload::WaveEnd {
                wave: wave_index,
                succeeded,
                failed,
            },
            format!("wave {wave_index} finished: {succeeded} ok, {failed} failed"),
        ));

        if failed == 0 && succeeded > 0 {
            self.ctx.recovery.decrease_stagger();
        }

        // Surface cross-worker doom loops at wave boundaries.
        for global_loop in self.ctx.economics.global_loops() {
            self.ctx.event_bus.emit(SwarmEvent::new(
                SwarmEventPayload::Info {
                    data: serde_json::json!({
                        "global_doom_loop": global_loop.fingerprint,
                        "total_calls": global_loop.total_calls,
                        "workers": global_loop.workers,
                    }),
                },
                "global doom loop detected",
            ));
        }

        if self.ctx.config.critic_enabled && succeeded > 0 {
            self.review_wave(wave_index, &wave_results).await;
        }

        self.checkpoint_to_store().await;

        if cancel.is_cancelled() {
            return Ok(Some(WaveOutcome::Cancelled));
        }
        Ok(None)
    }

    /// Feed one worker result through the gate and the queue.
    async fn handle_completion(
        &self,
        task: &SwarmTask,
        spec: &SwarmWorkerSpec,
        allocation: BudgetAllocation,
        result: SwarmTaskResult,
    ) -> SwarmResult<Disposition> {
        // Return unused budget before anything else so later wave members
        // benefit from the rebalance.
        self.ctx
            .budget
            .report_usage(allocation.allocation_id, result.tokens_used);
        self.ctx.budget.release(allocation.allocation_id);
        self.emit_budget_event(&task.id, allocation.allocated_tokens, result.tokens_used);

        let type_config = TaskTypeConfig::for_type(task.task_type);
        let retries_remaining = task.attempts < type_config.retry_limit;

        if result.success {
            return self
                .gate_successful_result(task, spec, result, retries_remaining)
                .await;
        }

        let run_cancelled = self.cancel_source.token().is_cancelled();
        let mut mode = result.failure_mode.unwrap_or(FailureMode::GenericFailure);

        if mode == FailureMode::RateLimit {
            if self.ctx.recovery.record_rate_limit() {
                self.ctx.event_bus.emit(SwarmEvent::new(
                    SwarmEventPayload::CircuitBreaker {
                        active: true,
                        pause_ms: self.ctx.recovery.pause_ms(),
                    },
                    "rate limit density tripped the circuit breaker",
                ));
            }
            self.ctx.recovery.increase_stagger();
        }

        if mode == FailureMode::Cancelled {
            if run_cancelled {
                // Record the terminal state; no retries during teardown.
                return self.fail_task(task, result, mode).await;
            }
            // Wave-timeout cancellation is a timeout for retry purposes.
            mode = FailureMode::Timeout;
        }

        // Auto-split preempts further retries: a complex task that has now
        // failed twice with splittable modes is replaced, not re-run whole.
        let mut probe = task.clone();
        probe.attempts += 1;
        probe.failure_history.push(mode);
        let conflict_pressure = task
            .target_files
            .iter()
            .any(|path| self.ctx.recovery.conflict_streak(path) >= 2);
        let wants_split = self.ctx.recovery.should_auto_split(&probe)
            || (conflict_pressure && !retries_remaining);

        if wants_split && self.ctx.recovery.try_consume_split() {
            let subtasks = self.split_task(&probe).await;
            let sub_ids = {
                let mut queue = self.queue.lock().await;
                queue.mark_decomposed(&task.id, subtasks)?
            };
            info!(task = %task.id, subtasks = sub_ids.len(), "task auto-split");
            self.ctx.event_bus.emit(
                SwarmEvent::new(
                    SwarmEventPayload::Info {
                        data: serde_json::json!({
                            "auto_split": task.id,
                            "subtasks": sub_ids,
                        }),
                    },
                    format!("{} decomposed into {} sub-tasks", task.id, sub_ids.len()),
                )
                .for_task(task.id.clone()),
            );
            return Ok(Disposition::Split);
        }

        if retries_remaining {
            {
                let mut queue = self.queue.lock().await;
                queue.requeue_for_retry(&task.id, mode)?;
            }
            self.ctx.event_bus.emit(
                SwarmEvent::new(
                    SwarmEventPayload::Fail {
                        failure_mode: mode,
                        attempt: task.attempts + 1,
                        will_retry: true,
                    },
                    format!("{} failed ({}); retrying", task.id, mode.as_str()),
                )
                .for_task(task.id.clone()),
            );
            return Ok(Disposition::Retried);
        }

        self.fail_task(task, result, mode).await
    }

    async fn gate_successful_result(
        &self,
        task: &SwarmTask,
        spec: &SwarmWorkerSpec,
        result: SwarmTaskResult,
        retries_remaining: bool,
    ) -> SwarmResult<Disposition> {
        let decision = self.gate.evaluate(task, &result, retries_remaining).await;
        if let Some(usage) = decision.judge_usage {
            self.ctx.budget.record_parent_usage(usage.total_tokens());
        }

        if decision.accepted {
            let mut stored = result;
            stored.accepted_with_degradation = decision.degraded;
            let tokens = stored.tokens_used;
            {
                let mut queue = self.queue.lock().await;
                queue.complete(&task.id, stored)?;
            }
            for path in &task.target_files {
                self.ctx.recovery.clear_conflicts(path);
            }
            self.ctx.event_bus.emit(
                SwarmEvent::new(
                    SwarmEventPayload::Complete {
                        score: decision.score,
                        degraded: decision.degraded,
                        tokens_used: tokens,
                    },
                    format!("{} accepted (score {:.2})", task.id, decision.score),
                )
                .for_task(task.id.clone()),
            );
            self.checkpoint_task(&task.id).await;
            return Ok(Disposition::Accepted);
        }

        if decision.requires_fixup {
            {
                let mut queue = self.queue.lock().await;
                queue.requeue_for_fixup(&task.id, self.ctx.config.fixup_counts_as_retry)?;
            }
            self.ctx.event_bus.emit(
                SwarmEvent::new(
                    SwarmEventPayload::Fail {
                        failure_mode: FailureMode::QualityRejection,
                        attempt: task.attempts + 1,
                        will_retry: true,
                    },
                    format!(
                        "{} rejected by quality gate (score {:.2}); fixup round",
                        task.id, decision.score
                    ),
                )
                .for_task(task.id.clone()),
            );
            return Ok(Disposition::Retried);
        }

        let mut rejected = result;
        rejected.success = false;
        rejected.failure_mode = Some(FailureMode::QualityRejection);
        self.ctx
            .health
            .record_failure(&spec.model, FailureMode::QualityRejection);
        self.fail_task(task, rejected, FailureMode::QualityRejection)
            .await
    }

    /// Terminal failure: record, emit, cascade-skip downstream.
    async fn fail_task(
        &self,
        task: &SwarmTask,
        result: SwarmTaskResult,
        mode: FailureMode,
    ) -> SwarmResult<Disposition> {
        let skipped = {
            let mut queue = self.queue.lock().await;
            queue.fail(&task.id, result)?
        };
        self.ctx.event_bus.emit(
            SwarmEvent::new(
                SwarmEventPayload::Fail {
                    failure_mode: mode,
                    attempt: task.attempts + 1,
                    will_retry: false,
                },
                format!("{} failed terminally ({})", task.id, mode.as_str()),
            )
            .for_task(task.id.clone()),
        );
        for skipped_id in skipped {
            self.ctx.event_bus.emit(
                SwarmEvent::new(
                    SwarmEventPayload::Skip {
                        cause_task_id: task.id.clone(),
                    },
                    format!("{skipped_id} skipped: dependency {} failed", task.id),
                )
                .for_task(skipped_id),
            );
        }
        self.checkpoint_task(&task.id).await;
        Ok(Disposition::Failed)
    }

    /// Re-promote skipped tasks whose prior attempts left artifacts on disk.
    /// Each task is rescued at most once per run.
    pub(super) async fn rescue_skipped(&self) -> usize {
        let candidates: Vec<String> = {
            let queue = self.queue.lock().await;
            queue
                .tasks()
                .iter()
                .filter(|t| t.status == TaskStatus::Skipped)
                .filter(|t| {
                    queue
                        .result(&t.id)
                        .is_some_and(|r| !r.artifacts_changed.is_empty())
                })
                .map(|t| t.id.clone())
                .collect()
        };

        let mut rescued = 0;
        for id in candidates {
            if !self.ctx.recovery.try_rescue(&id) {
                continue;
            }
            let mut queue = self.queue.lock().await;
            if queue.rescue(&id).is_ok() {
                info!(task = %id, "rescued skipped task with surviving artifacts");
                rescued += 1;
            }
        }
        rescued
    }

    /// Run the critic over a finished wave and enqueue its fixups.
    async fn review_wave(&self, wave_index: usize, wave_results: &[(String, bool)]) {
        let (completed, failed): (Vec<_>, Vec<_>) = {
            let queue = self.queue.lock().await;
            let mut completed = Vec::new();
            let mut failed = Vec::new();
            for (id, ok) in wave_results {
                if let Some(task) = queue.get(id) {
                    if *ok {
                        if let Some(result) = queue.result(id) {
                            completed.push((task.clone(), result.clone()));
                        }
                    } else {
                        failed.push(task.clone());
                    }
                }
            }
            (completed, failed)
        };

        let completed_refs: Vec<(&SwarmTask, &SwarmTaskResult)> =
            completed.iter().map(|(t, r)| (t, r)).collect();
        let failed_refs: Vec<&SwarmTask> = failed.iter().collect();
        let review = critic::review_wave(
            self.provider.as_ref(),
            &self.ctx.config,
            wave_index,
            &completed_refs,
            &failed_refs,
        )
        .await;
        if let Some(usage) = review.usage {
            self.ctx.budget.record_parent_usage(usage.total_tokens());
        }

        self.ctx.event_bus.emit(SwarmEvent::new(
            SwarmEventPayload::WaveReview {
                wave: wave_index,
                assessment: review.assessment.as_str().to_string(),
                fixup_count: review.fixup_instructions.len(),
            },
            format!("wave {} review: {}", wave_index, review.assessment.as_str()),
        ));

        for fixup in critic::build_fixup_tasks(&review, wave_index) {
            let mut queue = self.queue.lock().await;
            if let Err(e) = queue.insert_fixup(fixup) {
                warn!(error = %e, "critic fixup rejected");
            }
        }
    }

    fn emit_budget_event(&self, task_id: &str, allocated: u64, used: u64) {
        let stats = self.ctx.budget.stats();
        self.ctx.event_bus.emit(
            SwarmEvent::new(
                SwarmEventPayload::Budget {
                    allocated,
                    used,
                    available: stats.available,
                },
                format!("budget: {} available", stats.available),
            )
            .for_task(task_id.to_string()),
        );
    }
}
