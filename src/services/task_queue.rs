//! Task queue: DAG scheduling, wave composition, conflict policy, fixups.
//!
//! The queue owns every task's status machine. Ingest validates dependency
//! references and rejects cycles atomically (nothing is queued on error).
//! Wave composition returns the largest ready subset that respects the
//! file-conflict policy and the worker-pool size.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::config::FileConflictStrategy;
use crate::domain::models::dag::DependencyGraph;
use crate::domain::models::plan::{QueueSnapshot, SwarmQueueStats};
use crate::domain::models::task::{
    FailureMode, SwarmTask, SwarmTaskResult, TaskStatus,
};

/// A task displaced by the `first-wins` conflict policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictSkip {
    pub task_id: String,
    pub path: String,
    pub winner_task_id: String,
}

/// One composed wave.
#[derive(Debug, Clone, Default)]
pub struct WaveSelection {
    pub wave_index: usize,
    pub tasks: Vec<SwarmTask>,
    /// Tasks skipped under `first-wins`; already transitioned by the queue.
    pub conflicts: Vec<ConflictSkip>,
}

/// Dependency-aware task queue with wave scheduling.
pub struct TaskQueue {
    conflict_strategy: FileConflictStrategy,
    tasks: HashMap<String, SwarmTask>,
    /// Insertion order, for stable iteration and snapshots.
    order: Vec<String>,
    graph: DependencyGraph,
    results: HashMap<String, SwarmTaskResult>,
    current_wave: usize,
    total_waves: usize,
}

impl TaskQueue {
    pub fn new(conflict_strategy: FileConflictStrategy) -> Self {
        Self {
            conflict_strategy,
            tasks: HashMap::new(),
            order: Vec::new(),
            graph: DependencyGraph::default(),
            results: HashMap::new(),
            current_wave: 0,
            total_waves: 0,
        }
    }

    // -- Ingest and replan merge --

    /// Ingest a task set. Validation is atomic: unknown dependency references
    /// or cycles reject the whole set and queue nothing.
    pub fn ingest(&mut self, tasks: Vec<SwarmTask>) -> SwarmResult<()> {
        let mut candidate: HashMap<String, SwarmTask> = self.tasks.clone();
        let mut candidate_order = self.order.clone();
        for task in tasks {
            if candidate.contains_key(&task.id) {
                return Err(SwarmError::Configuration(format!(
                    "duplicate task id: {}",
                    task.id
                )));
            }
            candidate_order.push(task.id.clone());
            candidate.insert(task.id.clone(), task);
        }

        Self::validate(&candidate)?;

        self.tasks = candidate;
        self.order = candidate_order;
        self.rebuild_graph();
        self.total_waves = self
            .graph
            .execution_waves()
            .map_or(self.total_waves, |w| w.len());
        self.promote_ready();
        Ok(())
    }

    /// Merge a replanned task set by id: known non-terminal tasks get their
    /// dependencies refreshed, unknown tasks are appended.
    pub fn merge_replan(&mut self, tasks: Vec<SwarmTask>) -> SwarmResult<()> {
        let mut candidate = self.tasks.clone();
        let mut candidate_order = self.order.clone();
        for task in tasks {
            match candidate.get_mut(&task.id) {
                Some(existing) if !existing.status.is_terminal() => {
                    existing.dependencies = task.dependencies;
                    existing.description = task.description;
                    existing.target_files = task.target_files;
                    existing.priority = task.priority;
                }
                Some(_) => {} // terminal tasks keep their history
                None => {
                    candidate_order.push(task.id.clone());
                    candidate.insert(task.id.clone(), task);
                }
            }
        }

        Self::validate(&candidate)?;

        self.tasks = candidate;
        self.order = candidate_order;
        self.rebuild_graph();
        self.promote_ready();
        Ok(())
    }

    fn validate(tasks: &HashMap<String, SwarmTask>) -> SwarmResult<()> {
        for task in tasks.values() {
            for dep in &task.dependencies {
                if !tasks.contains_key(dep) {
                    return Err(SwarmError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        let graph = DependencyGraph::from_tasks(tasks.values());
        if let Some(involved) = graph.find_cycle() {
            return Err(SwarmError::DependencyCycle(involved));
        }
        Ok(())
    }

    fn rebuild_graph(&mut self) {
        self.graph = DependencyGraph::from_tasks(self.tasks.values());
    }

    // -- Readiness --

    /// A dependency is satisfied when completed, or skipped with surviving
    /// artifacts. Decomposed tasks never appear as dependencies: their
    /// dependents are rewired onto the split children.
    fn dependency_satisfied(&self, dep_id: &str) -> bool {
        match self.tasks.get(dep_id).map(|t| t.status) {
            Some(TaskStatus::Completed) => true,
            Some(TaskStatus::Skipped) => self
                .results
                .get(dep_id)
                .is_some_and(|r| !r.artifacts_changed.is_empty()),
            _ => false,
        }
    }

    /// Promote pending tasks whose dependencies are all satisfied.
    /// Returns the newly ready ids.
    pub fn promote_ready(&mut self) -> Vec<String> {
        let mut promoted = Vec::new();
        let ids: Vec<String> = self.order.clone();
        for id in ids {
            let Some(task) = self.tasks.get(&id) else { continue };
            if task.status != TaskStatus::Pending {
                continue;
            }
            let ready = task
                .dependencies
                .iter()
                .all(|dep| self.dependency_satisfied(dep));
            if ready {
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.status = TaskStatus::Ready;
                    promoted.push(id);
                }
            }
        }
        promoted
    }

    // -- Wave composition --

    /// Compose the next wave: up to `max_size` ready tasks, ordered by
    /// `(priority, dependent count desc, id)`, filtered by the conflict
    /// policy. Under `first-wins`, losers are skipped immediately and
    /// reported in the selection.
    pub fn next_wave(&mut self, max_size: usize) -> WaveSelection {
        let mut ready: Vec<&SwarmTask> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Ready)
            .collect();
        ready.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then_with(|| {
                    self.graph
                        .dependent_count(&b.id)
                        .cmp(&self.graph.dependent_count(&a.id))
                })
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut claimed_files: HashMap<String, String> = HashMap::new();
        let mut wave: Vec<SwarmTask> = Vec::new();
        let mut conflicts: Vec<ConflictSkip> = Vec::new();

        for task in ready {
            if wave.len() >= max_size {
                break;
            }
            let overlap = task
                .target_files
                .iter()
                .find(|f| claimed_files.contains_key(*f));
            match overlap {
                None => {
                    for file in &task.target_files {
                        claimed_files.insert(file.clone(), task.id.clone());
                    }
                    wave.push(task.clone());
                }
                Some(path) => match self.conflict_strategy {
                    // Overlapping tasks wait for a later wave.
                    FileConflictStrategy::Serialize => {}
                    FileConflictStrategy::FirstWins => {
                        conflicts.push(ConflictSkip {
                            task_id: task.id.clone(),
                            path: path.clone(),
                            winner_task_id: claimed_files[path].clone(),
                        });
                    }
                },
            }
        }

        for conflict in &conflicts {
            if let Some(task) = self.tasks.get_mut(&conflict.task_id) {
                task.status = TaskStatus::Skipped;
            }
        }

        if !wave.is_empty() {
            self.current_wave += 1;
        }
        WaveSelection {
            wave_index: self.current_wave,
            tasks: wave,
            conflicts,
        }
    }

    // -- Transitions --

    fn transition(&mut self, id: &str, to: TaskStatus) -> SwarmResult<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| SwarmError::TaskNotFound(id.to_string()))?;
        if !task.status.can_transition_to(to) {
            return Err(SwarmError::InvalidStateTransition {
                task: id.to_string(),
                from: task.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        task.status = to;
        Ok(())
    }

    pub fn mark_dispatched(&mut self, id: &str) -> SwarmResult<()> {
        self.transition(id, TaskStatus::Dispatched)
    }

    /// Record an accepted result and promote downstream tasks.
    /// Returns the newly ready ids.
    pub fn complete(&mut self, id: &str, result: SwarmTaskResult) -> SwarmResult<Vec<String>> {
        self.transition(id, TaskStatus::Completed)?;
        self.results.insert(id.to_string(), result);
        Ok(self.promote_ready())
    }

    /// Re-queue a dispatched task for another attempt.
    pub fn requeue_for_retry(&mut self, id: &str, mode: FailureMode) -> SwarmResult<()> {
        self.transition(id, TaskStatus::Ready)?;
        if let Some(task) = self.tasks.get_mut(id) {
            task.attempts += 1;
            task.failure_history.push(mode);
        }
        Ok(())
    }

    /// Re-queue after a judge fixup verdict. Whether this consumes a retry
    /// slot is a config decision (`fixup_counts_as_retry`).
    pub fn requeue_for_fixup(&mut self, id: &str, counts_as_retry: bool) -> SwarmResult<()> {
        self.transition(id, TaskStatus::Ready)?;
        if let Some(task) = self.tasks.get_mut(id) {
            if counts_as_retry {
                task.attempts += 1;
            }
            task.failure_history.push(FailureMode::QualityRejection);
        }
        Ok(())
    }

    /// Record a terminal failure and cascade-skip downstream tasks.
    /// Returns the skipped ids.
    pub fn fail(&mut self, id: &str, result: SwarmTaskResult) -> SwarmResult<Vec<String>> {
        let mode = result.failure_mode.unwrap_or(FailureMode::GenericFailure);
        self.transition(id, TaskStatus::Failed)?;
        if let Some(task) = self.tasks.get_mut(id) {
            task.attempts += 1;
            task.failure_history.push(mode);
        }
        self.results.insert(id.to_string(), result);

        let mut skipped = Vec::new();
        for downstream in self.graph.all_dependents(id) {
            if let Some(task) = self.tasks.get_mut(&downstream) {
                if matches!(task.status, TaskStatus::Pending | TaskStatus::Ready) {
                    task.status = TaskStatus::Skipped;
                    skipped.push(downstream);
                }
            }
        }
        skipped.sort_unstable();
        debug!(task = id, skipped = skipped.len(), "failure cascade");
        Ok(skipped)
    }

    /// Replace a task with auto-split sub-tasks. Sub-tasks inherit the
    /// original's dependencies; dependents of the original now depend on
    /// every sub-task instead.
    pub fn mark_decomposed(
        &mut self,
        id: &str,
        mut subtasks: Vec<SwarmTask>,
    ) -> SwarmResult<Vec<String>> {
        let original = self
            .tasks
            .get(id)
            .ok_or_else(|| SwarmError::TaskNotFound(id.to_string()))?
            .clone();
        if original.status.is_terminal() {
            return Err(SwarmError::InvalidStateTransition {
                task: id.to_string(),
                from: original.status.as_str().to_string(),
                to: TaskStatus::Decomposed.as_str().to_string(),
            });
        }

        let sub_ids: Vec<String> = subtasks.iter().map(|t| t.id.clone()).collect();
        let sub_id_set: HashSet<&String> = sub_ids.iter().collect();
        for subtask in &mut subtasks {
            // Inherit the original's dependencies on top of intra-split ones.
            for dep in &original.dependencies {
                if !subtask.dependencies.contains(dep) {
                    subtask.dependencies.push(dep.clone());
                }
            }
            subtask
                .dependencies
                .retain(|d| d != id && (sub_id_set.contains(d) || self.tasks.contains_key(d)));
        }

        let mut candidate = self.tasks.clone();
        let mut candidate_order = self.order.clone();
        for subtask in &subtasks {
            if candidate.contains_key(&subtask.id) {
                return Err(SwarmError::Configuration(format!(
                    "split sub-task id collides with existing task: {}",
                    subtask.id
                )));
            }
            candidate_order.push(subtask.id.clone());
            candidate.insert(subtask.id.clone(), subtask.clone());
        }
        // Rewire dependents of the original onto all sub-tasks.
        for task in candidate.values_mut() {
            if task.id != *id && task.dependencies.iter().any(|d| d == id) {
                task.dependencies.retain(|d| d != id);
                for sub in &sub_ids {
                    if !task.dependencies.contains(sub) {
                        task.dependencies.push(sub.clone());
                    }
                }
            }
        }
        if let Some(original) = candidate.get_mut(id) {
            original.status = TaskStatus::Decomposed;
        }

        Self::validate(&candidate)?;
        self.tasks = candidate;
        self.order = candidate_order;
        self.rebuild_graph();
        self.promote_ready();
        Ok(sub_ids)
    }

    /// Append a fixup task. Rejects cycles introduced via the fixup edge.
    pub fn insert_fixup(&mut self, fixup: SwarmTask) -> SwarmResult<()> {
        let fixes = fixup.fixes_task_id.clone().ok_or_else(|| {
            SwarmError::Configuration(format!("task {} is not a fixup", fixup.id))
        })?;
        if !self.tasks.contains_key(&fixes) {
            return Err(SwarmError::TaskNotFound(fixes));
        }
        self.ingest(vec![fixup])
    }

    /// Re-promote a skipped task (rescue). Attempt counters are preserved.
    pub fn rescue(&mut self, id: &str) -> SwarmResult<()> {
        self.transition(id, TaskStatus::Ready)
    }

    /// Skip a task that can no longer run (stalled queue, conflict loser).
    pub fn force_skip(&mut self, id: &str) -> SwarmResult<()> {
        self.transition(id, TaskStatus::Skipped)
    }

    // -- Introspection --

    pub fn get(&self, id: &str) -> Option<&SwarmTask> {
        self.tasks.get(id)
    }

    pub fn result(&self, id: &str) -> Option<&SwarmTaskResult> {
        self.results.get(id)
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> Vec<&SwarmTask> {
        self.order.iter().filter_map(|id| self.tasks.get(id)).collect()
    }

    pub fn results(&self) -> Vec<&SwarmTaskResult> {
        self.order
            .iter()
            .filter_map(|id| self.results.get(id))
            .collect()
    }

    pub fn stats(&self) -> SwarmQueueStats {
        let mut stats = SwarmQueueStats::default();
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Ready => stats.ready += 1,
                TaskStatus::Dispatched => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                // Decomposed originals are replaced, not counted as work.
                TaskStatus::Skipped => stats.skipped += 1,
                TaskStatus::Decomposed => {}
            }
        }
        stats
    }

    /// Whether any task can still make progress.
    pub fn has_pending_work(&self) -> bool {
        self.tasks.values().any(|t| !t.status.is_terminal())
    }

    pub fn current_wave(&self) -> usize {
        self.current_wave
    }

    pub fn total_waves(&self) -> usize {
        self.total_waves
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    // -- Snapshot / restore --

    pub fn snapshot_tasks(&self) -> Vec<SwarmTask> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .cloned()
            .collect()
    }

    pub fn snapshot_queue(&self) -> QueueSnapshot {
        QueueSnapshot {
            current_wave: self.current_wave,
            total_waves: self.total_waves,
            rescued: Vec::new(),
            auto_splits_used: 0,
        }
    }

    /// Restore from a checkpoint. Tasks caught mid-dispatch demote to ready;
    /// attempt counters are preserved.
    pub fn restore(&mut self, tasks: Vec<SwarmTask>, queue: &QueueSnapshot) -> SwarmResult<()> {
        let mut map = HashMap::new();
        let mut order = Vec::new();
        for mut task in tasks {
            if task.status == TaskStatus::Dispatched {
                task.status = TaskStatus::Ready;
            }
            order.push(task.id.clone());
            map.insert(task.id.clone(), task);
        }
        Self::validate(&map)?;
        self.tasks = map;
        self.order = order;
        self.rebuild_graph();
        self.current_wave = queue.current_wave;
        self.total_waves = queue.total_waves;
        Ok(())
    }
}
