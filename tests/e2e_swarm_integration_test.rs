//! End-to-end swarm scenarios against the mock provider and spawner.

use std::sync::Arc;

use codeswarm::adapters::{MockProvider, MockSpawner};
use codeswarm::domain::models::config::FileConflictStrategy;
use codeswarm::domain::models::plan::{RunReason, SwarmPhase};
use codeswarm::domain::models::task::{FailureMode, TaskStatus};
use codeswarm::domain::ports::spawner::SpawnResult;
use codeswarm::services::orchestrator::{SwarmOrchestrator, SwarmRunContext};
use codeswarm::SwarmConfig;

fn base_config() -> SwarmConfig {
    let mut config = SwarmConfig::default();
    config.use_judge = false;
    config.verification_enabled = false;
    config.critic_enabled = false;
    config.max_workers = 4;
    config.base_timeout_ms = 5_000;
    config.budget.parent_total = 100_000;
    config.budget.reserve_percent = 0.25;
    config.budget.max_per_child = 40_000;
    config
}

fn setup(
    config: SwarmConfig,
    provider: MockProvider,
    spawner: MockSpawner,
) -> (tempfile::TempDir, SwarmRunContext, SwarmOrchestrator) {
    let dir = tempfile::tempdir().unwrap();
    let ctx = SwarmRunContext::new(Arc::new(config), dir.path());
    let orchestrator = SwarmOrchestrator::new(ctx.clone(), Arc::new(provider), Arc::new(spawner));
    (dir, ctx, orchestrator)
}

fn three_task_decomposition() -> String {
    r#"{
        "strategy": "build then test",
        "subtasks": [
            {"id": "A", "description": "implement the module", "type": "implement",
             "complexity": 2, "dependencies": [], "target_files": ["x.py"], "priority": 2},
            {"id": "B", "description": "extend the module", "type": "implement",
             "complexity": 2, "dependencies": ["A"], "target_files": ["x.py"], "priority": 2},
            {"id": "C", "description": "test the module", "type": "test",
             "complexity": 1, "dependencies": ["B"], "target_files": [], "priority": 3}
        ]
    }"#
    .to_string()
}

#[tokio::test]
async fn test_happy_path_three_tasks() {
    let provider = MockProvider::scripted([Ok(three_task_decomposition())]);
    let spawner = MockSpawner::succeeding(20_000);
    let (_dir, ctx, orchestrator) = setup(base_config(), provider, spawner);

    let result = orchestrator.run("build and test the module").await.unwrap();

    assert!(result.success);
    assert_eq!(result.reason, RunReason::Completed);
    assert_eq!(result.stats.completed, 3);
    assert_eq!(result.stats.failed, 0);
    assert_eq!(orchestrator.phase(), SwarmPhase::Completed);
    assert_eq!(result.artifacts, vec!["x.py".to_string()]);

    // Budget conservation: used + available + reserved == parent total, and
    // every allocation was returned.
    let budget = ctx.budget.stats();
    assert_eq!(budget.used, 60_000);
    assert_eq!(budget.available, 15_000);
    assert_eq!(budget.used + budget.available + budget.reserved, 100_000);
    assert_eq!(budget.allocations, 0);

    // Event order per task: spawn strictly before complete.
    let events = ctx.event_bus.history();
    for id in ["A", "B", "C"] {
        let spawn_pos = events
            .iter()
            .position(|e| e.kind() == "spawn" && e.task_id.as_deref() == Some(id))
            .unwrap_or_else(|| panic!("no spawn event for {id}"));
        let complete_pos = events
            .iter()
            .position(|e| e.kind() == "complete" && e.task_id.as_deref() == Some(id))
            .unwrap_or_else(|| panic!("no complete event for {id}"));
        assert!(spawn_pos < complete_pos, "spawn({id}) must precede complete({id})");
    }

    // Dependencies forced three sequential waves.
    assert_eq!(result.stats.waves, 3);
}

fn conflicting_pair_decomposition() -> String {
    r#"{
        "strategy": "parallel edits",
        "subtasks": [
            {"id": "T1", "description": "edit y for feature one", "type": "implement",
             "complexity": 1, "dependencies": [], "target_files": ["y.py"], "priority": 2},
            {"id": "T2", "description": "edit y for feature two", "type": "implement",
             "complexity": 1, "dependencies": [], "target_files": ["y.py"], "priority": 2}
        ]
    }"#
    .to_string()
}

#[tokio::test]
async fn test_file_conflict_serialize_strategy() {
    let provider = MockProvider::scripted([Ok(conflicting_pair_decomposition())]);
    let spawner = MockSpawner::succeeding(5_000);
    let mut config = base_config();
    config.conflict_strategy = FileConflictStrategy::Serialize;
    let (_dir, ctx, orchestrator) = setup(config, provider, spawner);

    let result = orchestrator.run("two features in one file").await.unwrap();

    assert!(result.success);
    assert_eq!(result.stats.completed, 2);
    // Serialized: two waves, zero conflict events.
    assert_eq!(result.stats.waves, 2);
    let conflicts = ctx
        .event_bus
        .history()
        .iter()
        .filter(|e| e.kind() == "conflict")
        .count();
    assert_eq!(conflicts, 0);
}

#[tokio::test]
async fn test_file_conflict_first_wins_strategy() {
    let provider = MockProvider::scripted([Ok(conflicting_pair_decomposition())]);
    let spawner = MockSpawner::succeeding(5_000);
    let mut config = base_config();
    config.conflict_strategy = FileConflictStrategy::FirstWins;
    let (_dir, ctx, orchestrator) = setup(config, provider, spawner);

    let result = orchestrator.run("two features in one file").await.unwrap();

    // The loser is skipped, not failed; the run still succeeds.
    assert!(result.success);
    assert_eq!(result.stats.completed, 1);
    assert_eq!(result.stats.skipped, 1);

    let events = ctx.event_bus.history();
    let conflicts: Vec<_> = events.iter().filter(|e| e.kind() == "conflict").collect();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].task_id.as_deref(), Some("T2"));
}

#[tokio::test]
async fn test_occ_conflict_requeues_then_commits() {
    let provider = MockProvider::scripted([Ok(r#"{
        "strategy": "one contested file",
        "subtasks": [
            {"id": "W", "description": "edit the contested file", "type": "implement",
             "complexity": 1, "dependencies": [], "target_files": ["w.py"], "priority": 2}
        ]
    }"#
    .to_string())]);
    // The first optimistic write loses to an interleaved edit; the retry
    // snapshots fresh and commits.
    let spawner = MockSpawner::conflicting_writes(1);
    let (_dir, ctx, orchestrator) = setup(base_config(), provider, spawner);

    let result = orchestrator.run("contested edit").await.unwrap();

    assert!(result.success);
    assert_eq!(result.stats.completed, 1);

    let events = ctx.event_bus.history();
    // Exactly one version conflict, carrying real base/current hashes
    // (unlike wave-composition conflicts, which have none).
    let conflicts: Vec<serde_json::Value> = events
        .iter()
        .filter(|e| e.kind() == "conflict")
        .map(|e| serde_json::to_value(e).unwrap())
        .collect();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0]["task_id"], "W");
    let base = conflicts[0]["data"]["base_hash"].as_str().unwrap();
    let current = conflicts[0]["data"]["current_hash"].as_str().unwrap();
    assert!(!base.is_empty() && !current.is_empty() && base != current);

    // The conflict consumed one attempt, then the rewrite landed.
    let retried = events.iter().any(|e| {
        e.kind() == "fail" && serde_json::to_value(e).unwrap()["data"]["will_retry"] == true
    });
    assert!(retried, "conflict must requeue the task");
    let committed = events
        .iter()
        .any(|e| e.kind() == "write" && e.task_id.as_deref() == Some("W"));
    assert!(committed, "the retry must commit through the ledger");

    // The successful write reset the per-path conflict streak.
    assert_eq!(ctx.recovery.conflict_streak("w.py"), 0);
}

#[tokio::test]
async fn test_circuit_breaker_pauses_then_resumes() {
    let provider = MockProvider::scripted([Ok(r#"{
        "strategy": "one task",
        "subtasks": [
            {"id": "T1", "description": "implement it", "type": "implement",
             "complexity": 1, "dependencies": [], "target_files": ["z.py"], "priority": 2}
        ]
    }"#
    .to_string())]);
    // Two rate-limited attempts trip the breaker, the third succeeds.
    let rate_limited = SpawnResult {
        success: false,
        failure_mode: Some(FailureMode::RateLimit),
        raw_error: Some("429 too many requests".into()),
        ..SpawnResult::default()
    };
    let spawner = MockSpawner::scripted([rate_limited.clone(), rate_limited]);
    let mut config = base_config();
    config.recovery.circuit_breaker_threshold = 2;
    config.recovery.circuit_breaker_pause_ms = 100;
    let (_dir, ctx, orchestrator) = setup(config, provider, spawner);

    let result = orchestrator.run("rate limited work").await.unwrap();

    assert!(result.success, "third attempt should succeed after the pause");
    let events = ctx.event_bus.history();
    let breaker_pos = events
        .iter()
        .position(|e| e.kind() == "circuit_breaker")
        .expect("breaker event expected");
    // Dispatch resumed after the breaker: a spawn event follows it.
    let resumed = events
        .iter()
        .skip(breaker_pos + 1)
        .any(|e| e.kind() == "spawn");
    assert!(resumed, "a spawn must follow the circuit breaker event");

    // Rate limits also raised the inter-spawn stagger.
    assert!(ctx.recovery.stagger_ms() > 0);
    assert!(
        events.iter().filter(|e| e.kind() == "rate_limit").count() >= 2,
        "rate limit events must be visible to observers"
    );
}

#[tokio::test]
async fn test_auto_split_replaces_failing_task() {
    let provider = MockProvider::scripted([
        Ok(r#"{
            "strategy": "big task with a dependent",
            "subtasks": [
                {"id": "T", "description": "huge refactor", "type": "implement",
                 "complexity": 4, "dependencies": [], "target_files": ["big.py"], "priority": 2},
                {"id": "U", "description": "document the refactor", "type": "documentation",
                 "complexity": 1, "dependencies": ["T"], "target_files": ["docs.md"], "priority": 3}
            ]
        }"#
        .to_string()),
        // The split call returns three smaller subtasks.
        Ok(r#"{
            "subtasks": [
                {"id": "s1", "description": "refactor part one", "type": "implement",
                 "complexity": 2, "dependencies": [], "target_files": ["big.py"]},
                {"id": "s2", "description": "refactor part two", "type": "implement",
                 "complexity": 2, "dependencies": ["s1"], "target_files": ["big.py"]},
                {"id": "s3", "description": "refactor part three", "type": "implement",
                 "complexity": 2, "dependencies": ["s2"], "target_files": ["big.py"]}
            ]
        }"#
        .to_string()),
    ]);
    // T times out twice in a row, which preempts its final retry with a
    // split; everything after that succeeds.
    let timed_out = SpawnResult {
        success: false,
        failure_mode: Some(FailureMode::Timeout),
        raw_error: Some("worker timed out".into()),
        ..SpawnResult::default()
    };
    let spawner = MockSpawner::scripted([timed_out.clone(), timed_out]);
    let (_dir, _ctx, orchestrator) = setup(base_config(), provider, spawner);

    let result = orchestrator.run("huge refactor with docs").await.unwrap();

    // The original was replaced; sub-tasks and the dependent completed.
    assert!(result.success, "sub-tasks should complete: {:?}", result.reason);
    let snapshot = orchestrator.snapshot().await;
    let original = snapshot.tasks.iter().find(|t| t.id == "T").unwrap();
    assert_eq!(original.status, TaskStatus::Decomposed);

    let sub_ids: Vec<&str> = snapshot
        .tasks
        .iter()
        .filter(|t| t.id.starts_with("T."))
        .map(|t| t.id.as_str())
        .collect();
    assert_eq!(sub_ids.len(), 3);
    assert!(snapshot
        .tasks
        .iter()
        .filter(|t| t.id.starts_with("T."))
        .all(|t| t.complexity <= 3));

    // The dependent now depends on every sub-task instead of T.
    let dependent = snapshot.tasks.iter().find(|t| t.id == "U").unwrap();
    assert!(!dependent.dependencies.contains(&"T".to_string()));
    for sub in &sub_ids {
        assert!(dependent.dependencies.contains(&(*sub).to_string()));
    }
    assert_eq!(dependent.status, TaskStatus::Completed);

    // The consumed split slot survives checkpoint -> restore -> checkpoint,
    // so a restored run cannot exceed the per-run split cap.
    assert_eq!(snapshot.queue.auto_splits_used, 1);
    let dir2 = tempfile::tempdir().unwrap();
    let ctx2 = SwarmRunContext::new(Arc::new(base_config()), dir2.path());
    let restored = SwarmOrchestrator::new(
        ctx2,
        Arc::new(MockProvider::new()),
        Arc::new(MockSpawner::succeeding(5_000)),
    );
    restored.restore(&snapshot).await.unwrap();
    let second = restored.snapshot().await;
    assert_eq!(second.queue, snapshot.queue);
    assert_eq!(second.queue.auto_splits_used, 1);
}

#[tokio::test]
async fn test_degraded_acceptance() {
    let provider = MockProvider::scripted([
        Ok(r#"{
            "strategy": "one task",
            "subtasks": [
                {"id": "T", "description": "implement partially hard thing", "type": "implement",
                 "complexity": 2, "dependencies": [], "target_files": ["a.py"], "priority": 2}
            ]
        }"#
        .to_string()),
        // Judge scores below threshold but above the degraded floor.
        Ok(r#"{"score": 0.45, "verdict": "fixup", "reasons": ["tests missing"]}"#.to_string()),
    ]);
    let spawner = MockSpawner::succeeding(5_000);
    let mut config = base_config();
    config.use_judge = true;
    let (_dir, ctx, orchestrator) = setup(config, provider, spawner);

    let result = orchestrator.run("partially hard thing").await.unwrap();

    assert!(result.success);
    assert_eq!(result.stats.degraded, 1);
    assert!(result.task_results.iter().any(|r| r.accepted_with_degradation));

    let complete = ctx
        .event_bus
        .history()
        .into_iter()
        .find(|e| e.kind() == "complete")
        .expect("complete event");
    let json = serde_json::to_value(&complete).unwrap();
    assert_eq!(json["data"]["degraded"], true);
}

#[tokio::test]
async fn test_mid_run_replan_fires_once() {
    let provider = MockProvider::scripted([
        // T1 and T2 fight over y.py under first-wins; U depends on the loser,
        // so after wave 1 the queue stalls with U pending.
        Ok(r#"{
            "strategy": "stall bait",
            "subtasks": [
                {"id": "T1", "description": "edit y first", "type": "implement",
                 "complexity": 1, "dependencies": [], "target_files": ["y.py"], "priority": 2},
                {"id": "T2", "description": "edit y second", "type": "implement",
                 "complexity": 1, "dependencies": [], "target_files": ["y.py"], "priority": 2},
                {"id": "U", "description": "follow-up work", "type": "implement",
                 "complexity": 1, "dependencies": ["T2"], "target_files": ["u.py"], "priority": 2}
            ]
        }"#
        .to_string()),
        // The replan unblocks U.
        Ok(r#"{
            "strategy": "replanned",
            "subtasks": [
                {"id": "U", "description": "follow-up work", "type": "implement",
                 "complexity": 1, "dependencies": [], "target_files": ["u.py"], "priority": 2}
            ]
        }"#
        .to_string()),
    ]);
    let spawner = MockSpawner::succeeding(5_000);
    let mut config = base_config();
    config.conflict_strategy = FileConflictStrategy::FirstWins;
    let (_dir, ctx, orchestrator) = setup(config, provider, spawner);

    let result = orchestrator.run("stall then replan").await.unwrap();

    assert!(result.success);
    let snapshot = orchestrator.snapshot().await;
    let follow_up = snapshot.tasks.iter().find(|t| t.id == "U").unwrap();
    assert_eq!(follow_up.status, TaskStatus::Completed);

    // Exactly one replanning phase event for the whole run.
    let replans = ctx
        .event_bus
        .history()
        .iter()
        .filter(|e| {
            e.kind() == "phase"
                && serde_json::to_value(e).unwrap()["data"]["phase"] == "replanning"
        })
        .count();
    assert_eq!(replans, 1);
}

#[tokio::test]
async fn test_empty_decomposition_is_success() {
    let provider = MockProvider::scripted([Ok(
        r#"{"strategy": "nothing to do", "subtasks": []}"#.to_string()
    )]);
    let spawner = MockSpawner::succeeding(1_000);
    let (_dir, _ctx, orchestrator) = setup(base_config(), provider, spawner);

    // A plan with zero subtasks falls back to the emergency single task,
    // which the spawner completes; the run succeeds either way.
    let result = orchestrator.run("no-op goal").await.unwrap();
    assert!(result.success);
}

#[tokio::test]
async fn test_cancellation_mid_run() {
    let provider = MockProvider::scripted([Ok(three_task_decomposition())]);
    let spawner =
        MockSpawner::succeeding(5_000).with_delay(std::time::Duration::from_millis(200));
    let (_dir, _ctx, orchestrator) = setup(base_config(), provider, spawner);
    let orchestrator = Arc::new(orchestrator);

    let runner = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run("cancelled goal").await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    orchestrator.cancel("user hit ctrl-c");

    let result = runner.await.unwrap().unwrap();
    assert!(!result.success);
    assert_eq!(result.reason, RunReason::Cancelled);
    assert_eq!(orchestrator.phase(), SwarmPhase::Failed);
}

#[tokio::test]
async fn test_budget_exhaustion_returns_partial_result() {
    let provider = MockProvider::scripted([Ok(three_task_decomposition())]);
    let spawner = MockSpawner::succeeding(20_000);
    let mut config = base_config();
    // A 4k budget funds two 1k allocations (workers burn them fully), after
    // which the sequential cap can no longer reach the 1k minimum.
    config.budget.parent_total = 4_000;
    let (_dir, _ctx, orchestrator) = setup(config, provider, spawner);

    let result = orchestrator.run("underfunded goal").await.unwrap();

    assert!(!result.success);
    assert_eq!(result.reason, RunReason::Budget);
    // Whatever completed before exhaustion is still reported.
    assert!(result.stats.completed >= 1);
}

#[tokio::test]
async fn test_snapshot_restore_fixed_point() {
    let provider = MockProvider::scripted([Ok(three_task_decomposition())]);
    let spawner = MockSpawner::succeeding(5_000);
    let (_dir, ctx, orchestrator) = setup(base_config(), provider, spawner);
    orchestrator.run("roundtrip goal").await.unwrap();
    ctx.economics.record_tool_call("w1", "fp-1");

    let first = orchestrator.snapshot().await;

    let dir2 = tempfile::tempdir().unwrap();
    let ctx2 = SwarmRunContext::new(Arc::new(base_config()), dir2.path());
    let restored = SwarmOrchestrator::new(
        ctx2,
        Arc::new(MockProvider::new()),
        Arc::new(MockSpawner::succeeding(5_000)),
    );
    restored.restore(&first).await.unwrap();

    let second = restored.snapshot().await;
    assert_eq!(
        serde_json::to_value(&first.tasks).unwrap(),
        serde_json::to_value(&second.tasks).unwrap()
    );
    assert_eq!(first.queue, second.queue);
    assert_eq!(first.economics, second.economics);
    assert_eq!(first.budget, second.budget);
}

#[tokio::test]
async fn test_state_artifacts_written() {
    let run_dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::scripted([Ok(three_task_decomposition())]);
    let spawner = MockSpawner::succeeding(5_000);
    let mut config = base_config();
    config.run_root = Some(run_dir.path().to_path_buf());
    config.persist_events = true;
    let (_dir, _ctx, orchestrator) = setup(config, provider, spawner);

    orchestrator.run("persisted goal").await.unwrap();

    assert!(run_dir.path().join("swarm.state.json").exists());
    assert!(run_dir.path().join("manifest.json").exists());
    assert!(run_dir.path().join("swarm.events.jsonl").exists());
    assert!(run_dir.path().join("tasks").join("task-A.json").exists());

    let events = std::fs::read_to_string(run_dir.path().join("swarm.events.jsonl")).unwrap();
    assert!(events.lines().count() > 5);
    // Every line is one JSON object.
    for line in events.lines() {
        serde_json::from_str::<serde_json::Value>(line).unwrap();
    }
}
