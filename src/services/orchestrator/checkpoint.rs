//! Snapshot/restore and persisted run state.

use chrono::Utc;
use tracing::warn;

use crate::domain::errors::SwarmResult;
use crate::domain::models::plan::{SwarmCheckpoint, SwarmPhase};
use crate::domain::models::task::TaskStatus;

use super::SwarmOrchestrator;

/// Number of recent events carried inside a checkpoint.
const CHECKPOINT_EVENT_WINDOW: usize = 256;

impl SwarmOrchestrator {
    /// Capture a restorable snapshot of the run.
    pub async fn snapshot(&self) -> SwarmCheckpoint {
        let queue = self.queue.lock().await;
        let mut queue_state = queue.snapshot_queue();
        queue_state.rescued = self.ctx.recovery.rescued_tasks();
        queue_state.auto_splits_used = self.ctx.recovery.auto_splits_used();
        let goal = match self.goal.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        SwarmCheckpoint {
            run_id: self.run_id,
            goal,
            phase: self.phase(),
            tasks: queue.snapshot_tasks(),
            queue: queue_state,
            economics: self.ctx.economics.snapshot(),
            budget: self.ctx.budget.snapshot(),
            events: self.ctx.event_bus.recent(CHECKPOINT_EVENT_WINDOW),
            saved_at: Utc::now(),
        }
    }

    /// Restore queue, economics, budget, and recovery bookkeeping from a
    /// checkpoint. Tasks caught in `dispatched` demote to `ready`; attempt
    /// counters survive.
    pub async fn restore(&self, checkpoint: &SwarmCheckpoint) -> SwarmResult<()> {
        {
            let mut queue = self.queue.lock().await;
            queue.restore(checkpoint.tasks.clone(), &checkpoint.queue)?;
        }
        self.ctx.economics.restore(&checkpoint.economics);
        self.ctx.budget.restore(&checkpoint.budget);
        self.ctx.recovery.restore_rescued(&checkpoint.queue.rescued);
        self.ctx
            .recovery
            .restore_auto_splits(checkpoint.queue.auto_splits_used);
        {
            let mut goal = match self.goal.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            goal.clear();
            goal.push_str(&checkpoint.goal);
        }
        // A restored run re-enters planning regardless of the saved phase.
        let phase = if checkpoint.phase.is_terminal() {
            checkpoint.phase
        } else {
            SwarmPhase::Planning
        };
        self.set_phase(phase);
        Ok(())
    }

    /// Best-effort full-state persistence.
    pub(super) async fn checkpoint_to_store(&self) {
        let Some(store) = &self.state_store else { return };
        let checkpoint = self.snapshot().await;
        if let Err(e) = store.ensure_layout().await {
            warn!(error = %e, "state store unavailable");
            return;
        }
        if let Err(e) = store.write_state(&checkpoint).await {
            warn!(error = %e, "failed to persist swarm state");
        }
    }

    /// Best-effort per-task checkpoint.
    pub(super) async fn checkpoint_task(&self, task_id: &str) {
        let Some(store) = &self.state_store else { return };
        let task = {
            let queue = self.queue.lock().await;
            queue.get(task_id).cloned()
        };
        if let Some(task) = task {
            if let Err(e) = store.write_task(&task).await {
                warn!(task = %task.id, error = %e, "failed to persist task checkpoint");
            }
        }
    }

    /// Count of tasks that would re-run after a restore.
    pub async fn restorable_task_count(&self) -> usize {
        let queue = self.queue.lock().await;
        queue
            .tasks()
            .iter()
            .filter(|t| {
                matches!(
                    t.status,
                    TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Dispatched
                )
            })
            .count()
    }
}
