//! LLM-driven lifecycle phases: decomposition, split, replan, verification,
//! synthesis, and their deterministic fallbacks.
//!
//! Retryable provider errors are absorbed with exponential backoff; parse
//! failures fall back to the emergency paths instead of aborting the run.

use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use tracing::{info, warn};

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::plan::{SmartDecompositionResult, VerificationResult};
use crate::domain::models::task::{SwarmTask, TaskStatus, TaskType};
use crate::domain::ports::provider::{ChatMessage, ChatOptions, ChatResponse};
use crate::services::quality_gate::parse_first_json;

use super::SwarmOrchestrator;

const DECOMPOSITION_SYSTEM_PROMPT: &str = "You decompose a coding goal into subtasks for a \
swarm of agents. Reply with a single JSON object: {\"strategy\": <string>, \"subtasks\": \
[{\"id\", \"description\", \"type\", \"complexity\" (1-5), \"dependencies\": [ids], \
\"target_files\": [paths], \"priority\" (1-3)}]}. Subtask types: implement, research, review, \
test, refactor, design, fix, integrate, documentation. Keep the graph acyclic and ids short. \
No prose outside the JSON.";

const SPLIT_SYSTEM_PROMPT: &str = "You split one failing coding task into 2-4 smaller subtasks. \
Each must be strictly simpler than the original (lower complexity) and independently \
completable. Reply with a single JSON object: {\"subtasks\": [{\"id\", \"description\", \
\"type\", \"complexity\", \"dependencies\": [ids], \"target_files\": [paths]}]}. Dependencies \
may only reference sibling subtasks. No prose outside the JSON.";

const REPLAN_SYSTEM_PROMPT: &str = "Execution of a task graph has stalled. Re-plan the \
remaining tasks into a runnable dependency graph. Keep task ids stable where work is \
unchanged. Reply with the same JSON shape as a decomposition. No prose outside the JSON.";

/// How a decomposition response failed to parse, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecompositionFailure {
    EmptyResponse,
    NoJson,
    SchemaMismatch,
    Refusal,
}

/// Classify an unparseable decomposition response.
pub fn classify_decomposition_failure(content: &str) -> DecompositionFailure {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return DecompositionFailure::EmptyResponse;
    }
    let lower = trimmed.to_lowercase();
    if lower.starts_with("i cannot") || lower.starts_with("i can't") || lower.contains("unable to help") {
        return DecompositionFailure::Refusal;
    }
    if parse_first_json(trimmed).is_none() {
        return DecompositionFailure::NoJson;
    }
    DecompositionFailure::SchemaMismatch
}

/// The single-task fallback plan when decomposition cannot be parsed.
pub fn build_emergency_decomposition(goal: &str) -> Vec<SwarmTask> {
    vec![
        SwarmTask::new("task-1", goal, TaskType::Implement).with_complexity(3),
    ]
}

impl SwarmOrchestrator {
    /// One provider call with cancellation, per-call timeout, and backoff on
    /// retryable errors. Usage is charged to the parent reserve.
    pub(super) async fn chat_with_retry(
        &self,
        messages: Vec<ChatMessage>,
        options: ChatOptions,
        purpose: &str,
    ) -> SwarmResult<ChatResponse> {
        let cancel = self.cancel_source.token();
        let call_timeout = Duration::from_millis(self.ctx.config.provider_timeout_ms);
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_interval(Duration::from_secs(8))
            .with_max_elapsed_time(Some(Duration::from_secs(60)))
            .build();

        let response = backoff::future::retry(policy, || {
            let messages = messages.clone();
            let options = options.clone();
            let cancel = cancel.clone();
            async move {
                cancel
                    .check()
                    .map_err(backoff::Error::permanent)?;
                let call = self.provider.chat(messages, options);
                let raced = tokio::select! {
                    result = tokio::time::timeout(call_timeout, call) => result,
                    () = cancel.wait() => {
                        return Err(backoff::Error::permanent(SwarmError::Cancelled(
                            cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
                        )));
                    }
                };
                match raced {
                    // A provider timeout is transient.
                    Err(_elapsed) => Err(backoff::Error::transient(SwarmError::Provider {
                        retryable: true,
                        status_code: None,
                        message: "provider call timed out".to_string(),
                    })),
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(e)) => {
                        let err = SwarmError::Provider {
                            retryable: e.retryable,
                            status_code: e.status_code,
                            message: e.reason,
                        };
                        if err.is_retryable() {
                            Err(backoff::Error::transient(err))
                        } else {
                            Err(backoff::Error::permanent(err))
                        }
                    }
                }
            }
        })
        .await?;

        self.ctx
            .budget
            .record_parent_usage(response.usage.total_tokens());
        info!(
            purpose,
            tokens = response.usage.total_tokens(),
            "orchestrator provider call"
        );
        Ok(response)
    }

    /// Decompose the goal into tasks. Parse failures fall back to the
    /// emergency single-task plan; provider errors past backoff surface.
    pub(super) async fn decompose(&self, goal: &str) -> SwarmResult<Vec<SwarmTask>> {
        let options = ChatOptions::for_model(&self.ctx.config.orchestrator_model)
            .with_max_tokens(4_000)
            .with_temperature(0.2)
            .with_system(DECOMPOSITION_SYSTEM_PROMPT);
        let response = self
            .chat_with_retry(vec![ChatMessage::user(goal.to_string())], options, "decompose")
            .await?;

        match parse_decomposition(&response.content) {
            Some(result) => {
                info!(
                    subtasks = result.subtasks.len(),
                    strategy = %result.strategy,
                    "decomposition parsed"
                );
                Ok(result
                    .subtasks
                    .into_iter()
                    .map(crate::domain::models::plan::SmartSubtask::into_task)
                    .collect())
            }
            None => {
                let failure = classify_decomposition_failure(&response.content);
                warn!(?failure, "decomposition unparseable; using emergency plan");
                Ok(build_emergency_decomposition(goal))
            }
        }
    }

    /// Produce 2-4 sub-tasks for a failing task. Falls back to a
    /// deterministic two-way split when the provider output is unusable.
    pub(super) async fn split_task(&self, task: &SwarmTask) -> Vec<SwarmTask> {
        let prompt = format!(
            "Task {} (complexity {}) failed repeatedly ({}).\nDescription: {}\nTarget files: {}",
            task.id,
            task.complexity,
            task.failure_history
                .iter()
                .map(|m| m.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            task.description,
            task.target_files.join(", "),
        );
        let options = ChatOptions::for_model(&self.ctx.config.orchestrator_model)
            .with_max_tokens(2_000)
            .with_temperature(0.3)
            .with_system(SPLIT_SYSTEM_PROMPT);

        let llm_subtasks = match self
            .chat_with_retry(vec![ChatMessage::user(prompt)], options, "auto-split")
            .await
        {
            Ok(response) => parse_decomposition(&response.content).map(|result| {
                result
                    .subtasks
                    .into_iter()
                    .map(crate::domain::models::plan::SmartSubtask::into_task)
                    .collect::<Vec<_>>()
            }),
            Err(e) => {
                warn!(task = %task.id, error = %e, "split call failed");
                None
            }
        };

        let max_complexity = task.complexity.saturating_sub(1).max(1);
        match llm_subtasks {
            Some(subtasks) if (2..=4).contains(&subtasks.len()) => {
                // Namespace ids under the original and remap intra-split
                // dependency references accordingly.
                let mapping: std::collections::HashMap<String, String> = subtasks
                    .iter()
                    .enumerate()
                    .map(|(i, t)| (t.id.clone(), format!("{}.{}", task.id, i + 1)))
                    .collect();
                subtasks
                    .into_iter()
                    .enumerate()
                    .map(|(i, mut sub)| {
                        sub.id = format!("{}.{}", task.id, i + 1);
                        sub.complexity = sub.complexity.min(max_complexity);
                        sub.priority = task.priority;
                        sub.dependencies = sub
                            .dependencies
                            .iter()
                            .filter_map(|dep| mapping.get(dep).cloned())
                            .collect();
                        if sub.target_files.is_empty() {
                            sub.target_files = task.target_files.clone();
                        }
                        sub
                    })
                    .collect()
            }
            _ => deterministic_split(task, max_complexity),
        }
    }

    /// Replan the remaining graph; merge by task id. Errors are absorbed.
    pub(super) async fn replan(&self) -> bool {
        let remaining: Vec<SwarmTask> = {
            let queue = self.queue.lock().await;
            queue
                .tasks()
                .iter()
                .filter(|t| !t.status.is_terminal())
                .map(|t| (*t).clone())
                .collect()
        };
        if remaining.is_empty() {
            return false;
        }

        let listing: String = remaining
            .iter()
            .map(|t| {
                format!(
                    "- {} ({}, {}): {} [deps: {}]",
                    t.id,
                    t.task_type.as_str(),
                    t.status.as_str(),
                    t.description,
                    t.dependencies.join(", "),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let options = ChatOptions::for_model(&self.ctx.config.orchestrator_model)
            .with_max_tokens(4_000)
            .with_temperature(0.2)
            .with_system(REPLAN_SYSTEM_PROMPT);

        let Ok(response) = self
            .chat_with_retry(vec![ChatMessage::user(listing)], options, "replan")
            .await
        else {
            return false;
        };
        let Some(result) = parse_decomposition(&response.content) else {
            warn!("replan response unparseable; keeping current graph");
            return false;
        };

        let tasks: Vec<SwarmTask> = result
            .subtasks
            .into_iter()
            .map(crate::domain::models::plan::SmartSubtask::into_task)
            .collect();
        let mut queue = self.queue.lock().await;
        match queue.merge_replan(tasks) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "replan merge rejected");
                false
            }
        }
    }

    /// Run advisory verification prompts over completed tasks' artifacts.
    pub(super) async fn verify_completed_tasks(&self) -> Vec<VerificationResult> {
        let completed: Vec<(String, String, Vec<String>)> = {
            let queue = self.queue.lock().await;
            queue
                .tasks()
                .iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .filter_map(|t| {
                    queue.result(&t.id).map(|r| {
                        (t.id.clone(), t.description.clone(), r.artifacts_changed.clone())
                    })
                })
                .collect()
        };

        let mut results = Vec::new();
        for (task_id, description, artifacts) in completed {
            if artifacts.is_empty() {
                continue;
            }
            let prompt = format!(
                "Verify that this completed task's artifacts plausibly satisfy it.\n\
                 Task: {description}\nArtifacts: {}\n\
                 Reply with a single JSON object: {{\"passed\": bool, \"notes\": <string>}}.",
                artifacts.join(", "),
            );
            let options = ChatOptions::for_model(&self.ctx.config.orchestrator_model)
                .with_max_tokens(500)
                .with_temperature(0.0);
            match self
                .chat_with_retry(vec![ChatMessage::user(prompt)], options, "verify")
                .await
            {
                Ok(response) => {
                    let parsed = parse_first_json(&response.content);
                    let passed = parsed
                        .as_ref()
                        .and_then(|v| v["passed"].as_bool())
                        .unwrap_or(true);
                    let notes = parsed
                        .as_ref()
                        .and_then(|v| v["notes"].as_str())
                        .unwrap_or("")
                        .to_string();
                    results.push(VerificationResult { task_id, passed, notes });
                }
                Err(e) => {
                    // Verification never blocks acceptance already granted.
                    results.push(VerificationResult {
                        task_id,
                        passed: true,
                        notes: format!("verification unavailable: {e}"),
                    });
                }
            }
        }
        results
    }

    /// Summarize the run. Provider failures fall back to a deterministic
    /// summary.
    pub(super) async fn synthesize(&self) -> String {
        let (stats, artifacts) = {
            let queue = self.queue.lock().await;
            let artifacts: Vec<String> = queue
                .results()
                .iter()
                .flat_map(|r| r.artifacts_changed.iter().cloned())
                .collect();
            (queue.stats(), artifacts)
        };
        let fallback = format!(
            "{} completed, {} failed, {} skipped; {} artifacts changed.",
            stats.completed,
            stats.failed,
            stats.skipped,
            artifacts.len(),
        );

        let goal = match self.goal.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let prompt = format!(
            "Summarize this swarm run in a short paragraph for the user.\n\
             Goal: {goal}\nOutcome: {fallback}\nArtifacts: {}",
            artifacts.join(", "),
        );
        let options = ChatOptions::for_model(&self.ctx.config.orchestrator_model)
            .with_max_tokens(500)
            .with_temperature(0.3);
        match self
            .chat_with_retry(vec![ChatMessage::user(prompt)], options, "synthesize")
            .await
        {
            Ok(response) if !response.content.trim().is_empty() => response.content,
            _ => fallback,
        }
    }
}

/// A response missing the `subtasks` key is a schema mismatch; a present but
/// empty `subtasks` array is a valid empty plan.
fn parse_decomposition(content: &str) -> Option<SmartDecompositionResult> {
    let value = parse_first_json(content)?;
    value.get("subtasks")?;
    serde_json::from_value(value).ok()
}

/// Deterministic fallback split: a scoped first half and a completing second
/// half, serialized.
fn deterministic_split(task: &SwarmTask, max_complexity: u8) -> Vec<SwarmTask> {
    let first_id = format!("{}.1", task.id);
    let second_id = format!("{}.2", task.id);
    let first = SwarmTask::new(
        first_id.clone(),
        format!("First slice of: {} (set up structure and core path)", task.description),
        task.task_type,
    )
    .with_complexity(max_complexity)
    .with_target_files(task.target_files.clone())
    .with_priority(task.priority);
    let second = SwarmTask::new(
        second_id,
        format!("Finish and polish: {} (complete remaining cases)", task.description),
        task.task_type,
    )
    .with_complexity(max_complexity)
    .with_dependencies(vec![first_id])
    .with_target_files(task.target_files.clone())
    .with_priority(task.priority);
    vec![first, second]
}
