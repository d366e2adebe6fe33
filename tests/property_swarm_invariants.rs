//! Property tests for fingerprint stability and wave scheduling.

use std::collections::{HashMap, HashSet};

use codeswarm::domain::models::dag::DependencyGraph;
use codeswarm::domain::models::task::{SwarmTask, TaskType};
use codeswarm::services::economics::{canonical_json, fingerprint};
use proptest::prelude::*;

fn arb_json_value(depth: u32) -> BoxedStrategy<serde_json::Value> {
    let leaf = prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::from),
        any::<i32>().prop_map(serde_json::Value::from),
        "[a-z]{0,8}".prop_map(serde_json::Value::from),
    ];
    if depth == 0 {
        leaf.boxed()
    } else {
        prop_oneof![
            leaf,
            prop::collection::vec(arb_json_value(depth - 1), 0..4)
                .prop_map(serde_json::Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", arb_json_value(depth - 1), 0..4).prop_map(
                |map| serde_json::Value::Object(map.into_iter().collect())
            ),
        ]
        .boxed()
    }
}

/// Rebuild an object with its keys in reverse insertion order, recursively.
fn permute_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(String, serde_json::Value)> = map
                .iter()
                .map(|(k, v)| (k.clone(), permute_keys(v)))
                .collect();
            entries.reverse();
            serde_json::Value::Object(entries.into_iter().collect())
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(permute_keys).collect())
        }
        other => other.clone(),
    }
}

proptest! {
    /// Fingerprints are invariant under dictionary key permutation.
    #[test]
    fn prop_fingerprint_key_order_independent(value in arb_json_value(3)) {
        let permuted = permute_keys(&value);
        prop_assert_eq!(
            fingerprint("tool", &value),
            fingerprint("tool", &permuted),
            "canonical forms differ: {} vs {}",
            canonical_json(&value),
            canonical_json(&permuted)
        );
    }

    /// Canonical JSON itself is stable under permutation (fingerprint input).
    #[test]
    fn prop_canonical_json_stable(value in arb_json_value(3)) {
        prop_assert_eq!(canonical_json(&value), canonical_json(&permute_keys(&value)));
    }

    /// Every task appears in exactly one wave, and never before all of its
    /// dependencies' waves.
    #[test]
    fn prop_execution_waves_respect_dependencies(size in 1usize..24) {
        // Layered random-ish DAG: task i may depend on a few earlier tasks.
        let mut tasks = Vec::new();
        for i in 0..size {
            let deps: Vec<String> = (0..i)
                .filter(|j| (i * 7 + j * 13) % 5 == 0)
                .map(|j| format!("t{j}"))
                .collect();
            tasks.push(
                SwarmTask::new(format!("t{i}"), format!("task {i}"), TaskType::Implement)
                    .with_dependencies(deps),
            );
        }

        let graph = DependencyGraph::from_tasks(&tasks);
        let waves = graph.execution_waves().expect("acyclic by construction");

        let mut wave_of: HashMap<String, usize> = HashMap::new();
        for (index, wave) in waves.iter().enumerate() {
            for id in wave {
                prop_assert!(
                    wave_of.insert(id.clone(), index).is_none(),
                    "task {} scheduled twice",
                    id
                );
            }
        }
        prop_assert_eq!(wave_of.len(), size);

        for task in &tasks {
            for dep in &task.dependencies {
                prop_assert!(wave_of[dep] < wave_of[&task.id]);
            }
        }
    }

    /// Topological order visits every node once, dependencies first.
    #[test]
    fn prop_topological_order_sound(size in 1usize..24) {
        let mut tasks = Vec::new();
        for i in 0..size {
            let deps: Vec<String> = (0..i)
                .filter(|j| (i + j) % 3 == 0)
                .map(|j| format!("t{j}"))
                .collect();
            tasks.push(
                SwarmTask::new(format!("t{i}"), format!("task {i}"), TaskType::Implement)
                    .with_dependencies(deps),
            );
        }

        let graph = DependencyGraph::from_tasks(&tasks);
        let order = graph.topological_order().expect("acyclic by construction");
        prop_assert_eq!(order.len(), size);
        prop_assert_eq!(order.iter().collect::<HashSet<_>>().len(), size);

        let position: HashMap<&String, usize> =
            order.iter().enumerate().map(|(i, id)| (id, i)).collect();
        for task in &tasks {
            for dep in &task.dependencies {
                prop_assert!(position[dep] < position[&task.id]);
            }
        }
    }
}
