//! Mock provider and spawner adapters.
//!
//! Used by the test suite and the dry-run mode of the binary. The mock
//! spawner commits declared target files through the run's file ledger
//! (snapshot + optimistic write), so the quality gate's artifact inventory
//! and the ledger's conflict path behave as they would with real workers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::models::task::FailureMode;
use crate::domain::ports::provider::{
    ChatMessage, ChatOptions, ChatResponse, Provider, ProviderError, TokenUsage,
};
use crate::domain::ports::spawner::{AgentSpawner, SpawnResult, WorkerSpawnSpec};
use crate::services::file_ledger::WriteAttempt;

/// One scripted provider turn.
pub type ScriptedTurn = Result<String, ProviderError>;

/// Provider that replays a script of responses.
///
/// When the script runs dry it returns an approval JSON, which satisfies the
/// judge and harmlessly fails decomposition parsing (triggering the
/// emergency plan).
pub struct MockProvider {
    script: Mutex<VecDeque<ScriptedTurn>>,
    calls: AtomicUsize,
    tokens_per_call: u64,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            tokens_per_call: 200,
        }
    }

    pub fn scripted(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        let provider = Self::new();
        if let Ok(mut script) = provider.script.lock() {
            script.extend(turns);
        }
        provider
    }

    pub fn push(&self, turn: ScriptedTurn) {
        let mut script = match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        script.push_back(turn);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn chat(
        &self,
        _messages: Vec<ChatMessage>,
        _options: ChatOptions,
    ) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut script = match self.script.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            script.pop_front()
        };
        let content = match next {
            Some(Ok(content)) => content,
            Some(Err(error)) => return Err(error),
            None => r#"{"score": 1.0, "verdict": "approve", "reasons": []}"#.to_string(),
        };
        Ok(ChatResponse {
            content,
            usage: TokenUsage {
                input_tokens: self.tokens_per_call / 2,
                output_tokens: self.tokens_per_call / 2,
                ..TokenUsage::default()
            },
            stop_reason: Some("end_turn".to_string()),
            tool_calls: vec![],
        })
    }
}

/// What the mock spawner does for one task.
enum SpawnBehavior {
    /// Write every target file and succeed.
    Succeed { tokens_used: u64 },
    /// Fail with a fixed mode.
    Fail {
        mode: FailureMode,
        raw_error: String,
    },
    /// Per-call script, falling back to success when exhausted.
    Script(Mutex<VecDeque<SpawnResult>>),
    /// For the first `remaining` spawns, write against a base hash that an
    /// interleaved edit has superseded, producing a ledger conflict; write
    /// normally afterwards.
    StaleWrites { remaining: Mutex<u32> },
}

/// Spawner double with configurable behavior.
pub struct MockSpawner {
    behavior: SpawnBehavior,
    delay: std::time::Duration,
    calls: AtomicUsize,
}

impl MockSpawner {
    /// Succeed on every task, writing each declared target file.
    pub fn succeeding(tokens_used: u64) -> Self {
        Self {
            behavior: SpawnBehavior::Succeed { tokens_used },
            delay: std::time::Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail every task with the given mode.
    pub fn failing(mode: FailureMode, raw_error: impl Into<String>) -> Self {
        Self {
            behavior: SpawnBehavior::Fail {
                mode,
                raw_error: raw_error.into(),
            },
            delay: std::time::Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Replay a fixed sequence of results, then succeed.
    pub fn scripted(results: impl IntoIterator<Item = SpawnResult>) -> Self {
        Self {
            behavior: SpawnBehavior::Script(Mutex::new(results.into_iter().collect())),
            delay: std::time::Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Lose `conflicts` optimistic writes to an interleaved edit before
    /// writing cleanly. Exercises the ledger conflict path end to end.
    pub fn conflicting_writes(conflicts: u32) -> Self {
        Self {
            behavior: SpawnBehavior::StaleWrites {
                remaining: Mutex::new(conflicts),
            },
            delay: std::time::Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleep this long before answering each spawn (simulates slow workers).
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Commit every target file through the ledger's optimistic protocol.
    async fn write_artifacts(spec: &WorkerSpawnSpec) -> Result<Vec<String>, String> {
        let agent_id = format!("mock:{}", spec.task.id);
        let mut written = Vec::new();
        for path in &spec.task.target_files {
            let version = spec
                .ledger
                .snapshot(path, &agent_id)
                .await
                .map_err(|e| format!("snapshot failed for {path}: {e}"))?;
            let content = format!(
                "# generated for task {}\n# {}\n",
                spec.task.id, spec.task.description
            );
            let result = spec
                .ledger
                .attempt_write(WriteAttempt {
                    path: path.clone(),
                    agent_id: agent_id.clone(),
                    task_id: spec.task.id.clone(),
                    new_content: content,
                    base_hash: version.version_hash,
                })
                .await
                .map_err(|e| format!("write failed for {path}: {e}"))?;
            if result.conflict {
                return Err(format!("write conflict on {path}"));
            }
            written.push(path.clone());
        }
        Ok(written)
    }

    fn success_result(task_id: &str, artifacts: Vec<String>, tokens_used: u64) -> SpawnResult {
        SpawnResult {
            success: true,
            response: format!("Completed task {task_id}."),
            artifacts_changed: artifacts,
            tokens_used,
            cost_usd: 0.001,
            duration_ms: 5,
            failure_mode: None,
            raw_error: None,
        }
    }

    /// Snapshot a base version, let an interleaved edit land, then attempt
    /// the write with the now-stale base. The ledger rejects it and emits a
    /// conflict event; the worker reports the loss as its failure.
    async fn stale_write(spec: &WorkerSpawnSpec) -> SpawnResult {
        let agent_id = format!("mock:{}", spec.task.id);
        let Some(path) = spec.task.target_files.first() else {
            return SpawnResult::failed("stale writer needs a target file");
        };
        let version = match spec.ledger.snapshot(path, &agent_id).await {
            Ok(version) => version,
            Err(e) => return SpawnResult::failed(format!("snapshot failed: {e}")),
        };

        // Another writer lands between snapshot and commit.
        let absolute = spec.working_dir.join(path);
        if let Some(parent) = absolute.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let _ = tokio::fs::write(&absolute, "# interleaved edit\n").await;

        match spec
            .ledger
            .attempt_write(WriteAttempt {
                path: path.clone(),
                agent_id,
                task_id: spec.task.id.clone(),
                new_content: format!("# stale attempt for {}\n", spec.task.id),
                base_hash: version.version_hash,
            })
            .await
        {
            Ok(result) if result.conflict => SpawnResult {
                success: false,
                tokens_used: 50,
                duration_ms: 5,
                raw_error: Some(format!("write conflict on {path}")),
                ..SpawnResult::default()
            },
            Ok(_) => SpawnResult::failed("expected a conflict but the write committed"),
            Err(e) => SpawnResult::failed(format!("write failed: {e}")),
        }
    }
}

#[async_trait]
impl AgentSpawner for MockSpawner {
    async fn spawn(&self, spec: WorkerSpawnSpec) -> SpawnResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.behavior {
            SpawnBehavior::Succeed { tokens_used } => {
                match Self::write_artifacts(&spec).await {
                    Ok(artifacts) => Self::success_result(&spec.task.id, artifacts, *tokens_used),
                    Err(reason) => SpawnResult::failed(reason),
                }
            }
            SpawnBehavior::Fail { mode, raw_error } => SpawnResult {
                success: false,
                response: String::new(),
                artifacts_changed: vec![],
                tokens_used: 50,
                cost_usd: 0.0,
                duration_ms: 5,
                failure_mode: Some(*mode),
                raw_error: Some(raw_error.clone()),
            },
            SpawnBehavior::Script(script) => {
                let next = {
                    let mut script = match script.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    script.pop_front()
                };
                match next {
                    Some(result) => result,
                    None => match Self::write_artifacts(&spec).await {
                        Ok(artifacts) => Self::success_result(&spec.task.id, artifacts, 100),
                        Err(reason) => SpawnResult::failed(reason),
                    },
                }
            }
            SpawnBehavior::StaleWrites { remaining } => {
                let stale = {
                    let mut remaining = match remaining.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if *remaining > 0 {
                        *remaining -= 1;
                        true
                    } else {
                        false
                    }
                };
                if stale {
                    Self::stale_write(&spec).await
                } else {
                    match Self::write_artifacts(&spec).await {
                        Ok(artifacts) => Self::success_result(&spec.task.id, artifacts, 100),
                        Err(reason) => SpawnResult::failed(reason),
                    }
                }
            }
        }
    }
}
