//! Shared budget pool.
//!
//! The parent reserves a slice of the total for its own provider calls; the
//! remainder forms a child pool all workers draw from. Per-child caps scale
//! with priority and shrink as the pool drains (sequential spawn cap), and
//! unused tokens flow back on release so later children can draw more.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use uuid::Uuid;

use crate::domain::models::budget::{BudgetAllocation, BudgetPoolConfig, BudgetPoolStats};
use crate::domain::models::plan::BudgetPoolSnapshot;
use crate::domain::models::task::TaskPriority;

struct PoolState {
    /// Tokens new allocations draw from.
    uncommitted: u64,
    /// Consumption folded in from returned allocations.
    used_total: u64,
    /// Orchestrator-side usage, tracked against the reserve for reporting.
    parent_used: u64,
    expected_children: usize,
    outstanding: HashMap<Uuid, BudgetAllocation>,
}

/// Thread-safe shared budget pool. One mutex, no nested locks.
pub struct SharedBudgetPool {
    config: BudgetPoolConfig,
    state: Mutex<PoolState>,
}

impl SharedBudgetPool {
    pub fn new(config: BudgetPoolConfig) -> Self {
        let uncommitted = config.child_pool();
        Self {
            config,
            state: Mutex::new(PoolState {
                uncommitted,
                used_total: 0,
                parent_used: 0,
                expected_children: 0,
                outstanding: HashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &BudgetPoolConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Declare how many children the next planning round expects; informs the
    /// fair-share base of each per-child cap.
    pub fn set_expected_children(&self, n: usize) {
        self.lock().expected_children = n;
    }

    /// Reserve a child's cap against the pool. Returns `None` when the
    /// projected cap falls below the configured minimum.
    ///
    /// Atomic under the pool mutex: concurrent allocations never oversubscribe.
    pub fn allocate(
        &self,
        worker_id: &str,
        task_id: &str,
        priority: TaskPriority,
    ) -> Option<BudgetAllocation> {
        let mut state = self.lock();

        let fair_share = self.config.child_pool() / state.expected_children.max(1) as u64;
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let scaled = (fair_share as f64 * priority.budget_multiplier()).round() as u64;
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let sequential_cap =
            (state.uncommitted as f64 * self.config.sequential_spawn_cap).floor() as u64;

        // A tiny fair share (many expected children) still yields the
        // minimum viable allocation; only the sequential limit and the hard
        // per-child cap can refuse a child.
        let cap = scaled
            .max(self.config.min_allocation)
            .min(self.config.max_per_child)
            .min(sequential_cap);

        if cap < self.config.min_allocation {
            return None;
        }

        state.uncommitted -= cap;
        let allocation = BudgetAllocation {
            allocation_id: Uuid::new_v4(),
            worker_id: worker_id.to_string(),
            task_id: task_id.to_string(),
            allocated_tokens: cap,
            used_tokens: 0,
            returned_at: None,
        };
        state
            .outstanding
            .insert(allocation.allocation_id, allocation.clone());
        Some(allocation)
    }

    /// Update the used counter of an outstanding allocation. Usage is clamped
    /// to the allocated cap.
    pub fn report_usage(&self, allocation_id: Uuid, used: u64) {
        let mut state = self.lock();
        if let Some(alloc) = state.outstanding.get_mut(&allocation_id) {
            alloc.used_tokens = used.min(alloc.allocated_tokens);
        }
    }

    /// Return an allocation's unused remainder to the pool. Idempotent: a
    /// second release refunds nothing.
    pub fn release(&self, allocation_id: Uuid) -> u64 {
        let mut state = self.lock();
        let Some(mut alloc) = state.outstanding.remove(&allocation_id) else {
            return 0;
        };
        let unused = alloc.remaining();
        alloc.returned_at = Some(Utc::now());
        state.uncommitted += unused;
        state.used_total += alloc.used_tokens;
        unused
    }

    /// Track the orchestrator's own provider usage against the reserve.
    pub fn record_parent_usage(&self, tokens: u64) {
        self.lock().parent_used += tokens;
    }

    /// Whether nothing further can be dispatched: no projected cap can reach
    /// the minimum allocation and no allocation is outstanding.
    pub fn is_exhausted(&self) -> bool {
        let state = self.lock();
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let best_cap = (state.uncommitted as f64 * self.config.sequential_spawn_cap).floor() as u64;
        best_cap < self.config.min_allocation && state.outstanding.is_empty()
    }

    pub fn stats(&self) -> BudgetPoolStats {
        let state = self.lock();
        let outstanding_used: u64 = state.outstanding.values().map(|a| a.used_tokens).sum();
        let outstanding_unspent: u64 = state.outstanding.values().map(BudgetAllocation::remaining).sum();
        BudgetPoolStats {
            parent_total: self.config.parent_total,
            reserved: self.config.reserved(),
            child_pool: self.config.child_pool(),
            used: state.used_total + outstanding_used,
            available: state.uncommitted + outstanding_unspent,
            allocations: state.outstanding.len(),
            parent_used: state.parent_used,
        }
    }

    /// Serializable state for checkpoints.
    pub fn snapshot(&self) -> BudgetPoolSnapshot {
        let state = self.lock();
        let mut outstanding: Vec<BudgetAllocation> = state.outstanding.values().cloned().collect();
        outstanding.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        BudgetPoolSnapshot {
            uncommitted: state.uncommitted,
            used_total: state.used_total,
            parent_used: state.parent_used,
            expected_children: state.expected_children,
            outstanding,
        }
    }

    /// Restore from a checkpoint. Outstanding allocations come back as
    /// outstanding; restored runs release them when tasks re-dispatch.
    pub fn restore(&self, snapshot: &BudgetPoolSnapshot) {
        let mut state = self.lock();
        state.uncommitted = snapshot.uncommitted;
        state.used_total = snapshot.used_total;
        state.parent_used = snapshot.parent_used;
        state.expected_children = snapshot.expected_children;
        state.outstanding = snapshot
            .outstanding
            .iter()
            .map(|a| (a.allocation_id, a.clone()))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(parent_total: u64, max_per_child: u64) -> SharedBudgetPool {
        SharedBudgetPool::new(BudgetPoolConfig {
            parent_total,
            reserve_percent: 0.25,
            max_per_child,
            min_allocation: 1_000,
            sequential_spawn_cap: 0.60,
        })
    }

    #[test]
    fn test_conservation_invariant_through_lifecycle() {
        let pool = pool(100_000, 40_000);
        pool.set_expected_children(3);

        let assert_conserved = |pool: &SharedBudgetPool| {
            let s = pool.stats();
            assert_eq!(s.used + s.available + s.reserved, s.parent_total);
        };

        assert_conserved(&pool);
        let a = pool.allocate("w1", "t1", TaskPriority::Normal).unwrap();
        assert_conserved(&pool);
        pool.report_usage(a.allocation_id, 20_000);
        assert_conserved(&pool);
        pool.release(a.allocation_id);
        assert_conserved(&pool);
    }

    #[test]
    fn test_fair_share_and_multiplier() {
        let pool = pool(100_000, 40_000);
        pool.set_expected_children(3);
        // child_pool = 75_000, fair share = 25_000, normal multiplier 1.0
        let alloc = pool.allocate("w1", "t1", TaskPriority::Normal).unwrap();
        assert_eq!(alloc.allocated_tokens, 25_000);

        // critical scales to 37_500, then the sequential cap (60% of the
        // remaining 50_000) binds first
        let alloc = pool.allocate("w2", "t2", TaskPriority::Critical).unwrap();
        assert_eq!(alloc.allocated_tokens, 30_000);
    }

    #[test]
    fn test_single_critical_child_hits_max_per_child() {
        let pool = pool(100_000, 40_000);
        pool.set_expected_children(1);
        // fair share 75_000 * 1.5 = 112_500, capped at min(40_000, 60% of 75_000)
        let alloc = pool.allocate("w1", "t1", TaskPriority::Critical).unwrap();
        assert_eq!(alloc.allocated_tokens, 40_000);
    }

    #[test]
    fn test_sequential_spawn_cap_shrinks_allocations() {
        let pool = pool(100_000, 60_000);
        pool.set_expected_children(1);
        // First child takes 60% of 75_000 = 45_000.
        let first = pool.allocate("w1", "t1", TaskPriority::Normal).unwrap();
        assert_eq!(first.allocated_tokens, 45_000);
        // Second child is limited to 60% of the remaining 30_000.
        let second = pool.allocate("w2", "t2", TaskPriority::Normal).unwrap();
        assert_eq!(second.allocated_tokens, 18_000);
    }

    #[test]
    fn test_allocation_refused_below_minimum() {
        let pool = pool(10_000, 5_000);
        pool.set_expected_children(1);
        // Drain the pool.
        while pool.allocate("w", "t", TaskPriority::Normal).is_some() {}
        assert!(pool.allocate("w", "t", TaskPriority::Normal).is_none());
    }

    #[test]
    fn test_release_rebalances() {
        let pool = pool(100_000, 40_000);
        pool.set_expected_children(2);
        let a = pool.allocate("w1", "t1", TaskPriority::Normal).unwrap();
        pool.report_usage(a.allocation_id, 10_000);
        let returned = pool.release(a.allocation_id);
        assert_eq!(returned, a.allocated_tokens - 10_000);

        let stats = pool.stats();
        assert_eq!(stats.used, 10_000);
        assert_eq!(stats.available, pool.config().child_pool() - 10_000);
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool = pool(100_000, 40_000);
        pool.set_expected_children(1);
        let a = pool.allocate("w1", "t1", TaskPriority::Normal).unwrap();
        pool.report_usage(a.allocation_id, 5_000);
        let first = pool.release(a.allocation_id);
        let second = pool.release(a.allocation_id);
        assert!(first > 0);
        assert_eq!(second, 0);

        let stats = pool.stats();
        assert_eq!(stats.used, 5_000);
    }

    #[test]
    fn test_usage_clamped_to_cap() {
        let pool = pool(100_000, 40_000);
        pool.set_expected_children(1);
        let a = pool.allocate("w1", "t1", TaskPriority::Normal).unwrap();
        pool.report_usage(a.allocation_id, u64::MAX);
        pool.release(a.allocation_id);
        assert_eq!(pool.stats().used, a.allocated_tokens);
    }

    #[test]
    fn test_exhaustion() {
        let pool = pool(10_000, 10_000);
        pool.set_expected_children(1);
        assert!(!pool.is_exhausted());
        let mut allocations = Vec::new();
        while let Some(a) = pool.allocate("w", "t", TaskPriority::Normal) {
            allocations.push(a);
        }
        // Outstanding allocations keep the pool alive.
        assert!(!pool.is_exhausted());
        for a in &allocations {
            pool.report_usage(a.allocation_id, a.allocated_tokens);
            pool.release(a.allocation_id);
        }
        assert!(pool.is_exhausted());
    }

    #[test]
    fn test_snapshot_restore_fixed_point() {
        let pool = pool(100_000, 40_000);
        pool.set_expected_children(2);
        let a = pool.allocate("w1", "t1", TaskPriority::Normal).unwrap();
        pool.report_usage(a.allocation_id, 2_000);
        pool.record_parent_usage(500);

        let snapshot = pool.snapshot();
        let restored = SharedBudgetPool::new(*pool.config());
        restored.restore(&snapshot);
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.stats(), pool.stats());
    }
}
