//! Recovery strategies: rate-limit circuit breaker, adaptive stagger,
//! auto-split gating, skipped-task rescue, and one-shot replan arming.
//!
//! This module holds the state machines; the LLM-driven parts of recovery
//! (producing split sub-tasks, replanning) live in the orchestrator.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

use crate::domain::models::config::{RecoveryConfig, TaskTypeConfig};
use crate::domain::models::task::SwarmTask;

/// First non-zero stagger applied after a rate limit.
const STAGGER_BASE_MS: u64 = 250;

/// Shared recovery state for one run.
pub struct RecoveryState {
    config: RecoveryConfig,
    max_auto_splits: u32,
    rate_limits: Mutex<VecDeque<Instant>>,
    breaker_until: Mutex<Option<Instant>>,
    stagger_ms: AtomicU64,
    auto_splits_used: AtomicU32,
    replan_used: AtomicBool,
    rescued: Mutex<HashSet<String>>,
    path_conflicts: Mutex<HashMap<String, u32>>,
}

impl RecoveryState {
    pub fn new(config: RecoveryConfig, max_auto_splits: u32) -> Self {
        Self {
            config,
            max_auto_splits,
            rate_limits: Mutex::new(VecDeque::new()),
            breaker_until: Mutex::new(None),
            stagger_ms: AtomicU64::new(0),
            auto_splits_used: AtomicU32::new(0),
            replan_used: AtomicBool::new(false),
            rescued: Mutex::new(HashSet::new()),
            path_conflicts: Mutex::new(HashMap::new()),
        }
    }

    // -- Rate-limit window and circuit breaker --

    /// Record one rate-limit signal. Returns `true` when this signal tripped
    /// the breaker (transition from inactive to active).
    pub fn record_rate_limit(&self) -> bool {
        let now = Instant::now();
        let window = Duration::from_millis(self.config.circuit_breaker_window_ms);

        let in_window = {
            let mut events = match self.rate_limits.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            events.push_back(now);
            while events
                .front()
                .is_some_and(|&t| now.duration_since(t) > window)
            {
                events.pop_front();
            }
            events.len()
        };

        if in_window >= self.config.circuit_breaker_threshold {
            let mut until = match self.breaker_until.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let already_active = until.is_some_and(|t| t > now);
            if !already_active {
                *until = Some(now + Duration::from_millis(self.config.circuit_breaker_pause_ms));
                info!(
                    rate_limits = in_window,
                    pause_ms = self.config.circuit_breaker_pause_ms,
                    "circuit breaker tripped"
                );
                return true;
            }
        }
        false
    }

    /// Remaining pause while the breaker is active; `None` once cleared.
    /// The breaker auto-clears after its pause elapses.
    pub fn circuit_breaker_remaining(&self) -> Option<Duration> {
        let mut until = match self.breaker_until.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match *until {
            Some(t) => {
                let now = Instant::now();
                if t > now {
                    Some(t - now)
                } else {
                    *until = None;
                    None
                }
            }
            None => None,
        }
    }

    pub fn is_circuit_breaker_active(&self) -> bool {
        self.circuit_breaker_remaining().is_some()
    }

    pub fn pause_ms(&self) -> u64 {
        self.config.circuit_breaker_pause_ms
    }

    // -- Adaptive stagger --

    /// Current inter-spawn delay.
    pub fn stagger_ms(&self) -> u64 {
        self.stagger_ms.load(Ordering::Relaxed)
    }

    /// Double the stagger (from a small base) up to the configured cap.
    pub fn increase_stagger(&self) -> u64 {
        let mut current = self.stagger_ms.load(Ordering::Relaxed);
        loop {
            let next = if current == 0 {
                STAGGER_BASE_MS
            } else {
                (current * 2).min(self.config.max_stagger_ms)
            };
            match self.stagger_ms.compare_exchange(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Halve the stagger toward zero.
    pub fn decrease_stagger(&self) -> u64 {
        let mut current = self.stagger_ms.load(Ordering::Relaxed);
        loop {
            let next = if current <= STAGGER_BASE_MS { 0 } else { current / 2 };
            match self.stagger_ms.compare_exchange(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    // -- Auto-split --

    /// Whether a task qualifies for micro-decomposition: it is out of plain
    /// retries, complex enough per its type config, and its last two attempts
    /// failed with splittable modes.
    pub fn should_auto_split(&self, task: &SwarmTask) -> bool {
        let type_config = TaskTypeConfig::for_type(task.task_type);
        if task.attempts + 1 < type_config.retry_limit {
            return false;
        }
        if task.complexity < type_config.auto_split_complexity {
            return false;
        }
        let recent = task.recent_failures();
        recent.len() == 2 && recent.iter().all(|m| m.is_splittable())
    }

    /// Consume one auto-split slot; `false` once the per-run cap is reached.
    pub fn try_consume_split(&self) -> bool {
        self.auto_splits_used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.max_auto_splits).then_some(used + 1)
            })
            .is_ok()
    }

    pub fn auto_splits_used(&self) -> u32 {
        self.auto_splits_used.load(Ordering::SeqCst)
    }

    /// Reinstate the split counter from a checkpoint so a restored run
    /// cannot exceed the per-run cap across a restart.
    pub fn restore_auto_splits(&self, used: u32) {
        self.auto_splits_used.store(used, Ordering::SeqCst);
    }

    // -- Rescue --

    /// A skipped task with surviving artifacts may be re-promoted once.
    pub fn try_rescue(&self, task_id: &str) -> bool {
        let mut rescued = match self.rescued.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        rescued.insert(task_id.to_string())
    }

    pub fn rescued_tasks(&self) -> Vec<String> {
        let rescued = match self.rescued.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut tasks: Vec<String> = rescued.iter().cloned().collect();
        tasks.sort_unstable();
        tasks
    }

    pub fn restore_rescued(&self, tasks: &[String]) {
        let mut rescued = match self.rescued.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        rescued.extend(tasks.iter().cloned());
    }

    // -- Ledger conflict escalation --

    /// Record a write conflict on a path; returns the consecutive count.
    pub fn record_conflict(&self, path: &str) -> u32 {
        let mut conflicts = match self.path_conflicts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = conflicts.entry(path.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Current consecutive-conflict count for a path.
    pub fn conflict_streak(&self, path: &str) -> u32 {
        let conflicts = match self.path_conflicts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        conflicts.get(path).copied().unwrap_or(0)
    }

    /// A successful write on the path resets the streak.
    pub fn clear_conflicts(&self, path: &str) {
        let mut conflicts = match self.path_conflicts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        conflicts.remove(path);
    }

    // -- Mid-run replan --

    /// Arm the one-shot replan when the queue has stalled. Returns `true`
    /// exactly once per run.
    pub fn try_arm_replan(&self, pending: usize, ready: usize, stalled_ticks: u32) -> bool {
        if pending == 0 || ready > 0 || stalled_ticks < self.config.stall_ticks_before_replan {
            return false;
        }
        !self.replan_used.swap(true, Ordering::SeqCst)
    }

    pub fn replan_used(&self) -> bool {
        self.replan_used.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::task::{FailureMode, TaskType};

    fn recovery(window_ms: u64, pause_ms: u64) -> RecoveryState {
        RecoveryState::new(
            RecoveryConfig {
                circuit_breaker_window_ms: window_ms,
                circuit_breaker_threshold: 3,
                circuit_breaker_pause_ms: pause_ms,
                max_stagger_ms: 5_000,
                stall_ticks_before_replan: 2,
            },
            3,
        )
    }

    #[test]
    fn test_breaker_trips_at_threshold() {
        let recovery = recovery(30_000, 15_000);
        assert!(!recovery.record_rate_limit());
        assert!(!recovery.record_rate_limit());
        assert!(recovery.record_rate_limit());
        assert!(recovery.is_circuit_breaker_active());
        // Further signals while active do not re-trip.
        assert!(!recovery.record_rate_limit());
    }

    #[test]
    fn test_breaker_auto_clears() {
        let recovery = recovery(30_000, 20);
        for _ in 0..3 {
            recovery.record_rate_limit();
        }
        assert!(recovery.is_circuit_breaker_active());
        std::thread::sleep(Duration::from_millis(30));
        assert!(!recovery.is_circuit_breaker_active());
    }

    #[test]
    fn test_window_prunes_old_events() {
        let recovery = recovery(20, 15_000);
        recovery.record_rate_limit();
        recovery.record_rate_limit();
        std::thread::sleep(Duration::from_millis(30));
        // Old events fell out of the window; this is 1 of 3 again.
        assert!(!recovery.record_rate_limit());
        assert!(!recovery.is_circuit_breaker_active());
    }

    #[test]
    fn test_stagger_doubles_and_caps() {
        let recovery = recovery(30_000, 15_000);
        assert_eq!(recovery.stagger_ms(), 0);
        assert_eq!(recovery.increase_stagger(), STAGGER_BASE_MS);
        assert_eq!(recovery.increase_stagger(), STAGGER_BASE_MS * 2);
        for _ in 0..10 {
            recovery.increase_stagger();
        }
        assert_eq!(recovery.stagger_ms(), 5_000);
    }

    #[test]
    fn test_stagger_decreases_toward_zero() {
        let recovery = recovery(30_000, 15_000);
        recovery.increase_stagger();
        recovery.increase_stagger(); // 500
        assert_eq!(recovery.decrease_stagger(), 250);
        assert_eq!(recovery.decrease_stagger(), 0);
        assert_eq!(recovery.decrease_stagger(), 0);
    }

    fn failing_task(complexity: u8, modes: &[FailureMode], attempts: u32) -> SwarmTask {
        let mut task = SwarmTask::new("t1", "hard work", TaskType::Implement)
            .with_complexity(complexity);
        task.attempts = attempts;
        task.failure_history = modes.to_vec();
        task
    }

    #[test]
    fn test_auto_split_requires_all_conditions() {
        let recovery = recovery(30_000, 15_000);
        // implement: retry_limit 2, split at complexity 4
        let qualified = failing_task(4, &[FailureMode::Timeout, FailureMode::Timeout], 1);
        assert!(recovery.should_auto_split(&qualified));

        // Too simple.
        let simple = failing_task(3, &[FailureMode::Timeout, FailureMode::Timeout], 1);
        assert!(!recovery.should_auto_split(&simple));

        // Retries not yet exhausted.
        let fresh = failing_task(4, &[FailureMode::Timeout], 0);
        assert!(!recovery.should_auto_split(&fresh));

        // Rate-limit failures are not splittable.
        let rate_limited = failing_task(4, &[FailureMode::RateLimit, FailureMode::RateLimit], 1);
        assert!(!recovery.should_auto_split(&rate_limited));
    }

    #[test]
    fn test_split_budget_cap() {
        let recovery = recovery(30_000, 15_000);
        assert!(recovery.try_consume_split());
        assert!(recovery.try_consume_split());
        assert!(recovery.try_consume_split());
        assert!(!recovery.try_consume_split());
        assert_eq!(recovery.auto_splits_used(), 3);
    }

    #[test]
    fn test_restored_split_counter_respects_cap() {
        let recovery = recovery(30_000, 15_000);
        recovery.restore_auto_splits(2);
        assert_eq!(recovery.auto_splits_used(), 2);
        // One slot left out of the cap of 3.
        assert!(recovery.try_consume_split());
        assert!(!recovery.try_consume_split());
    }

    #[test]
    fn test_rescue_is_once_per_task() {
        let recovery = recovery(30_000, 15_000);
        assert!(recovery.try_rescue("t1"));
        assert!(!recovery.try_rescue("t1"));
        assert!(recovery.try_rescue("t2"));
        assert_eq!(recovery.rescued_tasks(), vec!["t1", "t2"]);
    }

    #[test]
    fn test_conflict_streaks() {
        let recovery = recovery(30_000, 15_000);
        assert_eq!(recovery.record_conflict("a.py"), 1);
        assert_eq!(recovery.record_conflict("a.py"), 2);
        recovery.clear_conflicts("a.py");
        assert_eq!(recovery.record_conflict("a.py"), 1);
    }

    #[test]
    fn test_replan_fires_once() {
        let recovery = recovery(30_000, 15_000);
        // Not stalled long enough.
        assert!(!recovery.try_arm_replan(4, 0, 1));
        // Ready work exists.
        assert!(!recovery.try_arm_replan(4, 1, 2));
        // Stalled: fires exactly once.
        assert!(recovery.try_arm_replan(4, 0, 2));
        assert!(!recovery.try_arm_replan(4, 0, 5));
        assert!(recovery.replan_used());
    }
}
