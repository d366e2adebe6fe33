//! Shared economics state: cross-worker doom loop detection.
//!
//! Every worker reports `(tool, args)` fingerprints into one map so loops
//! that span multiple agents (several workers hammering the same failing
//! call) are visible globally, not just per worker.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::domain::models::plan::EconomicsSnapshot;

/// Truncated hex length of a fingerprint.
const FINGERPRINT_LEN: usize = 16;

/// Compute the canonical fingerprint of a tool call.
///
/// The argument JSON is normalized first (keys sorted recursively, integral
/// floats collapsed) so the fingerprint is stable across processes and
/// argument orderings.
pub fn fingerprint(tool_name: &str, arguments: &Value) -> String {
    let canonical = canonical_json(arguments);
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update(b":");
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..FINGERPRINT_LEN].to_string()
}

/// Render a JSON value in canonical form: object keys sorted recursively,
/// numbers with an integral value rendered without a fraction.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => canonical_number(n),
        Value::String(s) => Value::String(s.clone()).to_string(),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let inner: Vec<String> = sorted
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}:{}",
                        Value::String((*k).clone()),
                        canonical_json(v)
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
    }
}

fn canonical_number(n: &serde_json::Number) -> String {
    if let Some(f) = n.as_f64() {
        #[allow(clippy::cast_possible_truncation)]
        if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
            return format!("{}", f as i64);
        }
    }
    n.to_string()
}

/// Configuration for the global loop detector.
#[derive(Debug, Clone, Copy)]
pub struct EconomicsConfig {
    /// Aggregate identical-call count that flags a global doom loop.
    pub global_doom_threshold: u64,
}

impl Default for EconomicsConfig {
    fn default() -> Self {
        Self {
            global_doom_threshold: 10,
        }
    }
}

/// Aggregated info about one fingerprint crossing the threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalLoopInfo {
    pub fingerprint: String,
    pub total_calls: u64,
    pub workers: Vec<String>,
}

/// Aggregate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EconomicsStats {
    pub unique_fingerprints: usize,
    pub total_calls: u64,
    pub active_doom_loops: usize,
}

/// Thread-safe cross-worker tool call aggregation.
///
/// One mutex guards the whole map; operations never hold it across awaits.
#[derive(Debug, Default)]
pub struct SharedEconomics {
    config: EconomicsConfig,
    calls: Mutex<HashMap<String, HashMap<String, u64>>>,
}

impl SharedEconomics {
    pub fn new(config: EconomicsConfig) -> Self {
        Self {
            config,
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, u64>>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Report one tool call from a worker.
    pub fn record_tool_call(&self, worker_id: &str, fingerprint: &str) {
        let mut calls = self.lock();
        *calls
            .entry(fingerprint.to_string())
            .or_default()
            .entry(worker_id.to_string())
            .or_insert(0) += 1;
    }

    /// Whether the aggregate count for a fingerprint crossed the threshold.
    pub fn is_global_doom_loop(&self, fingerprint: &str) -> bool {
        let calls = self.lock();
        calls
            .get(fingerprint)
            .is_some_and(|workers| workers.values().sum::<u64>() >= self.config.global_doom_threshold)
    }

    /// Info for one fingerprint, if it has been seen.
    pub fn global_loop_info(&self, fingerprint: &str) -> Option<GlobalLoopInfo> {
        let calls = self.lock();
        calls.get(fingerprint).map(|workers| {
            let mut worker_ids: Vec<String> = workers.keys().cloned().collect();
            worker_ids.sort_unstable();
            GlobalLoopInfo {
                fingerprint: fingerprint.to_string(),
                total_calls: workers.values().sum(),
                workers: worker_ids,
            }
        })
    }

    /// All fingerprints currently over the threshold.
    pub fn global_loops(&self) -> Vec<GlobalLoopInfo> {
        let calls = self.lock();
        let mut loops: Vec<GlobalLoopInfo> = calls
            .iter()
            .filter(|(_, workers)| {
                workers.values().sum::<u64>() >= self.config.global_doom_threshold
            })
            .map(|(fp, workers)| {
                let mut worker_ids: Vec<String> = workers.keys().cloned().collect();
                worker_ids.sort_unstable();
                GlobalLoopInfo {
                    fingerprint: fp.clone(),
                    total_calls: workers.values().sum(),
                    workers: worker_ids,
                }
            })
            .collect();
        loops.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        loops
    }

    pub fn stats(&self) -> EconomicsStats {
        let calls = self.lock();
        EconomicsStats {
            unique_fingerprints: calls.len(),
            total_calls: calls.values().map(|w| w.values().sum::<u64>()).sum(),
            active_doom_loops: calls
                .values()
                .filter(|w| w.values().sum::<u64>() >= self.config.global_doom_threshold)
                .count(),
        }
    }

    /// Serializable state for checkpoints.
    pub fn snapshot(&self) -> EconomicsSnapshot {
        let calls = self.lock();
        calls
            .iter()
            .map(|(fp, workers)| {
                (
                    fp.clone(),
                    workers
                        .iter()
                        .map(|(w, c)| (w.clone(), *c))
                        .collect::<BTreeMap<_, _>>(),
                )
            })
            .collect()
    }

    /// Replace state from a checkpoint.
    pub fn restore(&self, snapshot: &EconomicsSnapshot) {
        let mut calls = self.lock();
        calls.clear();
        for (fp, workers) in snapshot {
            calls.insert(
                fp.clone(),
                workers.iter().map(|(w, c)| (w.clone(), *c)).collect(),
            );
        }
    }

    /// Drop all state. Records are otherwise monotonic for a run.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = json!({"path": "a.py", "mode": "read", "depth": 2});
        let b = json!({"depth": 2, "mode": "read", "path": "a.py"});
        assert_eq!(fingerprint("read_file", &a), fingerprint("read_file", &b));
    }

    #[test]
    fn test_fingerprint_canonicalizes_integral_floats() {
        let a = json!({"count": 3.0});
        let b = json!({"count": 3});
        assert_eq!(fingerprint("tool", &a), fingerprint("tool", &b));
    }

    #[test]
    fn test_fingerprint_differs_by_tool_and_args() {
        let args = json!({"path": "a.py"});
        assert_ne!(fingerprint("read_file", &args), fingerprint("write_file", &args));
        assert_ne!(
            fingerprint("read_file", &args),
            fingerprint("read_file", &json!({"path": "b.py"}))
        );
    }

    #[test]
    fn test_fingerprint_nested_normalization() {
        let a = json!({"outer": {"b": 1, "a": [1.0, {"y": 2, "x": 3}]}});
        let b = json!({"outer": {"a": [1, {"x": 3, "y": 2}], "b": 1}});
        assert_eq!(fingerprint("t", &a), fingerprint("t", &b));
    }

    #[test]
    fn test_fingerprint_length() {
        assert_eq!(fingerprint("t", &json!({})).len(), FINGERPRINT_LEN);
    }

    #[test]
    fn test_global_doom_loop_threshold() {
        let economics = SharedEconomics::new(EconomicsConfig {
            global_doom_threshold: 3,
        });
        let fp = fingerprint("bash", &json!({"command": "ls"}));

        economics.record_tool_call("w1", &fp);
        economics.record_tool_call("w2", &fp);
        assert!(!economics.is_global_doom_loop(&fp));

        economics.record_tool_call("w3", &fp);
        assert!(economics.is_global_doom_loop(&fp));

        let info = economics.global_loop_info(&fp).unwrap();
        assert_eq!(info.total_calls, 3);
        assert_eq!(info.workers, vec!["w1", "w2", "w3"]);
    }

    #[test]
    fn test_total_equals_sum_of_worker_reports() {
        let economics = SharedEconomics::default();
        let fp_a = fingerprint("a", &json!({}));
        let fp_b = fingerprint("b", &json!({}));

        for _ in 0..4 {
            economics.record_tool_call("w1", &fp_a);
        }
        for _ in 0..2 {
            economics.record_tool_call("w2", &fp_a);
        }
        economics.record_tool_call("w2", &fp_b);

        let stats = economics.stats();
        assert_eq!(stats.total_calls, 7);
        assert_eq!(stats.unique_fingerprints, 2);
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let economics = SharedEconomics::default();
        economics.record_tool_call("w1", "fp1");
        economics.record_tool_call("w1", "fp1");
        economics.record_tool_call("w2", "fp2");

        let snapshot = economics.snapshot();
        let restored = SharedEconomics::default();
        restored.restore(&snapshot);

        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.stats().total_calls, 3);
    }

    #[test]
    fn test_clear() {
        let economics = SharedEconomics::default();
        economics.record_tool_call("w1", "fp1");
        economics.clear();
        assert_eq!(economics.stats().total_calls, 0);
    }
}
