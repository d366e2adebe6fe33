//! Budget pool domain models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Configuration of the shared parent/child budget pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetPoolConfig {
    /// Total token budget for the run (parent reserve + child pool).
    pub parent_total: u64,
    /// Fraction of the total held back for the orchestrator's own calls.
    pub reserve_percent: f64,
    /// Hard per-child allocation cap.
    pub max_per_child: u64,
    /// Allocations below this floor are refused.
    pub min_allocation: u64,
    /// A single child never receives more than this share of what is left.
    pub sequential_spawn_cap: f64,
}

impl Default for BudgetPoolConfig {
    fn default() -> Self {
        Self {
            parent_total: 1_000_000,
            reserve_percent: 0.25,
            max_per_child: 200_000,
            min_allocation: 1_000,
            sequential_spawn_cap: 0.60,
        }
    }
}

impl BudgetPoolConfig {
    /// Tokens held back for the parent.
    pub fn reserved(&self) -> u64 {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            (self.parent_total as f64 * self.reserve_percent).round() as u64
        }
    }

    /// Tokens available to children at run start.
    pub fn child_pool(&self) -> u64 {
        self.parent_total - self.reserved()
    }
}

/// One child's reservation against the shared pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAllocation {
    pub allocation_id: Uuid,
    pub worker_id: String,
    pub task_id: String,
    pub allocated_tokens: u64,
    pub used_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returned_at: Option<DateTime<Utc>>,
}

impl BudgetAllocation {
    pub fn remaining(&self) -> u64 {
        self.allocated_tokens.saturating_sub(self.used_tokens)
    }

    pub fn is_returned(&self) -> bool {
        self.returned_at.is_some()
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetPoolStats {
    pub parent_total: u64,
    pub reserved: u64,
    pub child_pool: u64,
    /// Tokens actually consumed by children so far.
    pub used: u64,
    /// Unspent tokens: the uncommitted pool plus the unspent remainder of
    /// outstanding allocations. `used + available + reserved == parent_total`
    /// holds at every snapshot.
    pub available: u64,
    /// Outstanding (not yet returned) allocations.
    pub allocations: usize,
    /// Tokens the orchestrator itself has drawn from the reserve.
    pub parent_used: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_split() {
        let config = BudgetPoolConfig {
            parent_total: 100_000,
            reserve_percent: 0.25,
            ..BudgetPoolConfig::default()
        };
        assert_eq!(config.reserved(), 25_000);
        assert_eq!(config.child_pool(), 75_000);
    }

    #[test]
    fn test_allocation_remaining() {
        let alloc = BudgetAllocation {
            allocation_id: Uuid::new_v4(),
            worker_id: "w1".into(),
            task_id: "t1".into(),
            allocated_tokens: 10_000,
            used_tokens: 4_000,
            returned_at: None,
        };
        assert_eq!(alloc.remaining(), 6_000);
        assert!(!alloc.is_returned());
    }
}
