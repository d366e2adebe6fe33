//! Task dependency graph.
//!
//! Adjacency both ways (task -> dependencies, task -> dependents) plus a flat
//! edge list for visualization. Provides cycle detection, topological order,
//! and wave grouping for the scheduler.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use super::task::SwarmTask;

/// A node in the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyNode {
    pub task_id: String,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
}

/// Dependency graph over swarm tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub nodes: HashMap<String, DependencyNode>,
    /// `(from, to)` pairs where `from` must complete before `to`.
    pub edges: Vec<(String, String)>,
}

impl DependencyGraph {
    /// Build a graph from tasks. Dependencies pointing outside the task set
    /// are kept in the node (the queue validates them separately) but do not
    /// produce edges.
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a SwarmTask>) -> Self {
        let tasks: Vec<&SwarmTask> = tasks.into_iter().collect();
        let mut nodes: HashMap<String, DependencyNode> = tasks
            .iter()
            .map(|t| {
                (
                    t.id.clone(),
                    DependencyNode {
                        task_id: t.id.clone(),
                        dependencies: t.dependencies.clone(),
                        dependents: Vec::new(),
                    },
                )
            })
            .collect();

        let mut edges = Vec::new();
        for task in &tasks {
            for dep in &task.dependencies {
                if nodes.contains_key(dep) {
                    edges.push((dep.clone(), task.id.clone()));
                    if let Some(dep_node) = nodes.get_mut(dep) {
                        dep_node.dependents.push(task.id.clone());
                    }
                }
            }
        }

        Self { nodes, edges }
    }

    /// Tasks with no in-graph dependencies.
    pub fn roots(&self) -> Vec<&str> {
        let mut roots: Vec<&str> = self
            .nodes
            .values()
            .filter(|n| {
                n.dependencies
                    .iter()
                    .all(|d| !self.nodes.contains_key(d))
            })
            .map(|n| n.task_id.as_str())
            .collect();
        roots.sort_unstable();
        roots
    }

    /// Check whether the graph contains a dependency cycle, returning one
    /// involved task id if so.
    pub fn find_cycle(&self) -> Option<String> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();

        let mut ids: Vec<&String> = self.nodes.keys().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(found) = self.cycle_dfs(id, &mut visited, &mut rec_stack) {
                return Some(found);
            }
        }
        None
    }

    fn cycle_dfs(
        &self,
        id: &str,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
    ) -> Option<String> {
        if rec_stack.contains(id) {
            return Some(id.to_string());
        }
        if visited.contains(id) {
            return None;
        }
        visited.insert(id.to_string());
        rec_stack.insert(id.to_string());

        if let Some(node) = self.nodes.get(id) {
            for dep in &node.dependents {
                if let Some(found) = self.cycle_dfs(dep, visited, rec_stack) {
                    return Some(found);
                }
            }
        }

        rec_stack.remove(id);
        None
    }

    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// Topological order (Kahn's algorithm) with deterministic tie-breaks.
    pub fn topological_order(&self) -> Option<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for node in self.nodes.values() {
            let deps = node
                .dependencies
                .iter()
                .filter(|d| self.nodes.contains_key(*d))
                .count();
            in_degree.insert(node.task_id.as_str(), deps);
        }

        let mut queue: VecDeque<&str> = {
            let mut zero: Vec<&str> = in_degree
                .iter()
                .filter(|(_, &d)| d == 0)
                .map(|(&id, _)| id)
                .collect();
            zero.sort_unstable();
            zero.into()
        };

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            if let Some(node) = self.nodes.get(id) {
                let mut unlocked = Vec::new();
                for dependent in &node.dependents {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            unlocked.push(dependent.as_str());
                        }
                    }
                }
                unlocked.sort_unstable();
                queue.extend(unlocked);
            }
        }

        (order.len() == self.nodes.len()).then_some(order)
    }

    /// Group tasks into waves: each wave's members depend only on earlier
    /// waves. Returns `None` when a cycle prevents scheduling.
    pub fn execution_waves(&self) -> Option<Vec<Vec<String>>> {
        if self.has_cycle() {
            return None;
        }

        let mut waves = Vec::new();
        let mut remaining: HashSet<&str> = self.nodes.keys().map(String::as_str).collect();
        let mut done: HashSet<&str> = HashSet::new();

        while !remaining.is_empty() {
            let mut wave: Vec<&str> = remaining
                .iter()
                .filter(|id| {
                    self.nodes[**id]
                        .dependencies
                        .iter()
                        .all(|d| !self.nodes.contains_key(d) || done.contains(d.as_str()))
                })
                .copied()
                .collect();

            if wave.is_empty() {
                return None;
            }
            wave.sort_unstable();

            for id in &wave {
                remaining.remove(id);
                done.insert(id);
            }
            waves.push(wave.into_iter().map(str::to_string).collect());
        }

        Some(waves)
    }

    /// All tasks downstream of `task_id` (transitively).
    pub fn all_dependents(&self, task_id: &str) -> HashSet<String> {
        let mut result = HashSet::new();
        let mut queue = VecDeque::new();
        if let Some(node) = self.nodes.get(task_id) {
            queue.extend(node.dependents.iter().cloned());
        }
        while let Some(id) = queue.pop_front() {
            if result.insert(id.clone()) {
                if let Some(node) = self.nodes.get(&id) {
                    queue.extend(node.dependents.iter().cloned());
                }
            }
        }
        result
    }

    /// Direct dependent count, used by wave ordering.
    pub fn dependent_count(&self, task_id: &str) -> usize {
        self.nodes.get(task_id).map_or(0, |n| n.dependents.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::task::TaskType;

    fn task(id: &str, deps: &[&str]) -> SwarmTask {
        SwarmTask::new(id, format!("task {id}"), TaskType::Implement)
            .with_dependencies(deps.iter().map(ToString::to_string).collect())
    }

    #[test]
    fn test_simple_graph() {
        let tasks = vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])];
        let graph = DependencyGraph::from_tasks(&tasks);
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.roots(), vec!["a"]);
        assert!(!graph.has_cycle());
    }

    #[test]
    fn test_topological_order_respects_deps() {
        let tasks = vec![task("a", &[]), task("b", &["a"]), task("c", &["a"])];
        let graph = DependencyGraph::from_tasks(&tasks);
        let order = graph.topological_order().unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
    }

    #[test]
    fn test_execution_waves() {
        let tasks = vec![
            task("a", &[]),
            task("b", &[]),
            task("c", &["a", "b"]),
            task("d", &["c"]),
        ];
        let graph = DependencyGraph::from_tasks(&tasks);
        let waves = graph.execution_waves().unwrap();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0], vec!["a".to_string(), "b".to_string()]);
        assert_eq!(waves[1], vec!["c".to_string()]);
        assert_eq!(waves[2], vec!["d".to_string()]);
    }

    #[test]
    fn test_cycle_detection() {
        let tasks = vec![task("a", &["c"]), task("b", &["a"]), task("c", &["b"])];
        let graph = DependencyGraph::from_tasks(&tasks);
        assert!(graph.has_cycle());
        assert!(graph.topological_order().is_none());
        assert!(graph.execution_waves().is_none());
    }

    #[test]
    fn test_all_dependents_transitive() {
        let tasks = vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["b"]),
            task("d", &[]),
        ];
        let graph = DependencyGraph::from_tasks(&tasks);
        let downstream = graph.all_dependents("a");
        assert_eq!(downstream.len(), 2);
        assert!(downstream.contains("b"));
        assert!(downstream.contains("c"));
        assert!(!downstream.contains("d"));
    }

    #[test]
    fn test_external_deps_ignored_in_edges() {
        let tasks = vec![task("a", &["external"])];
        let graph = DependencyGraph::from_tasks(&tasks);
        assert!(graph.edges.is_empty());
        assert_eq!(graph.roots(), vec!["a"]);
    }
}
