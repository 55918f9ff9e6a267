//! Task dependency graph (DAG) for coordinator runs.
//!
//! Validates the task list at construction (unique ids, resolvable
//! dependencies, acyclicity), answers readiness and critical-path queries,
//! and mirrors task completion as the run advances.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SwarmError};

/// A task as supplied by the caller. Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique, non-empty identifier.
    pub id: String,
    /// Ids of tasks that must complete before this one may start.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Instructions handed to the worker as its system prompt.
    pub instructions: String,
    /// Working directory assigned to the worker.
    pub workspace_path: String,
    /// Optional worker type hint forwarded in the assignment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_type: Option<String>,
    /// Estimated requests-per-minute this task will consume while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_rpm: Option<u32>,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            instructions: instructions.into(),
            workspace_path: "/".to_string(),
            worker_type: None,
            estimated_rpm: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_workspace(mut self, path: impl Into<String>) -> Self {
        self.workspace_path = path.into();
        self
    }

    pub fn with_estimated_rpm(mut self, rpm: u32) -> Self {
        self.estimated_rpm = Some(rpm);
        self
    }
}

/// Execution state of a task node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A node in the DAG: the input task plus derived edges and mutable run
/// state.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub spec: TaskSpec,
    /// Tasks this node depends on.
    pub deps: HashSet<String>,
    /// Tasks that depend on this node.
    pub dependents: HashSet<String>,
    pub state: TaskState,
    pub completed: bool,
}

impl TaskNode {
    fn new(spec: TaskSpec) -> Self {
        let deps = spec.dependencies.iter().cloned().collect();
        Self {
            spec,
            deps,
            dependents: HashSet::new(),
            state: TaskState::Pending,
            completed: false,
        }
    }
}

/// Counts of nodes per state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Directed acyclic graph over the input task list.
///
/// Insertion order is preserved so readiness and critical-path queries are
/// deterministic for a given input.
#[derive(Debug)]
pub struct TaskGraph {
    nodes: HashMap<String, TaskNode>,
    order: Vec<String>,
}

impl TaskGraph {
    /// Build and validate the graph.
    ///
    /// Fails with [`SwarmError::InvalidGraph`] on empty or duplicate ids,
    /// dependencies that do not resolve to another task, or cycles
    /// (self-loops included). The cycle error names the offending path.
    pub fn new(specs: Vec<TaskSpec>) -> Result<Self> {
        let mut nodes: HashMap<String, TaskNode> = HashMap::with_capacity(specs.len());
        let mut order = Vec::with_capacity(specs.len());

        for spec in specs {
            if spec.id.is_empty() {
                return Err(SwarmError::InvalidGraph("task id must not be empty".into()));
            }
            if nodes.contains_key(&spec.id) {
                return Err(SwarmError::InvalidGraph(format!(
                    "duplicate task id: {}",
                    spec.id
                )));
            }
            order.push(spec.id.clone());
            nodes.insert(spec.id.clone(), TaskNode::new(spec));
        }

        // Resolve dependencies and mirror dependent edges.
        for id in &order {
            let deps: Vec<String> = nodes[id].deps.iter().cloned().collect();
            for dep in deps {
                if !nodes.contains_key(&dep) {
                    return Err(SwarmError::InvalidGraph(format!(
                        "task {} depends on unknown task {}",
                        id, dep
                    )));
                }
                if let Some(node) = nodes.get_mut(&dep) {
                    node.dependents.insert(id.clone());
                }
            }
        }

        let graph = Self { nodes, order };
        if let Some(cycle) = graph.find_cycle() {
            return Err(SwarmError::InvalidGraph(format!(
                "dependency cycle: {}",
                cycle.join(" -> ")
            )));
        }
        Ok(graph)
    }

    /// DFS with an explicit recursion stack; returns the cycle path when
    /// one exists.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut on_stack: HashSet<&str> = HashSet::new();
        let mut path: Vec<&str> = Vec::new();

        fn visit<'a>(
            id: &'a str,
            nodes: &'a HashMap<String, TaskNode>,
            visited: &mut HashSet<&'a str>,
            on_stack: &mut HashSet<&'a str>,
            path: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            visited.insert(id);
            on_stack.insert(id);
            path.push(id);

            let mut deps: Vec<&str> = nodes[id].deps.iter().map(String::as_str).collect();
            deps.sort_unstable();
            for dep in deps {
                if on_stack.contains(dep) {
                    let start = path.iter().position(|p| *p == dep).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.to_string());
                    return Some(cycle);
                }
                if !visited.contains(dep) {
                    if let Some(cycle) = visit(dep, nodes, visited, on_stack, path) {
                        return Some(cycle);
                    }
                }
            }

            on_stack.remove(id);
            path.pop();
            None
        }

        for id in &self.order {
            if !visited.contains(id.as_str()) {
                if let Some(cycle) = visit(id, &self.nodes, &mut visited, &mut on_stack, &mut path)
                {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Ids of pending tasks whose every dependency has completed, in
    /// insertion order.
    pub fn ready_tasks(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                let node = &self.nodes[*id];
                node.state == TaskState::Pending
                    && node
                        .deps
                        .iter()
                        .all(|d| self.nodes.get(d).is_some_and(|n| n.completed))
            })
            .cloned()
            .collect()
    }

    /// The longest chain of incomplete tasks, measured in task count.
    ///
    /// Computed by topological layering with a longest-incoming-path DP.
    /// On length ties the first node discovered in topological order wins,
    /// so the result is deterministic for a given input.
    pub fn critical_path(&self) -> Vec<String> {
        let incomplete: HashSet<&str> = self
            .order
            .iter()
            .filter(|id| !self.nodes[*id].completed)
            .map(String::as_str)
            .collect();
        if incomplete.is_empty() {
            return Vec::new();
        }

        // Kahn layering restricted to incomplete nodes, seeded in insertion
        // order for determinism.
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        for id in &incomplete {
            let n = self.nodes[*id]
                .deps
                .iter()
                .filter(|d| incomplete.contains(d.as_str()))
                .count();
            indegree.insert(id, n);
        }

        let mut topo: Vec<&str> = Vec::with_capacity(incomplete.len());
        let mut frontier: Vec<&str> = self
            .order
            .iter()
            .map(String::as_str)
            .filter(|id| incomplete.contains(id) && indegree[id] == 0)
            .collect();

        let mut position: HashMap<&str, usize> = HashMap::new();
        while !frontier.is_empty() {
            let mut next: Vec<&str> = Vec::new();
            for id in frontier {
                position.insert(id, topo.len());
                topo.push(id);
                let mut dependents: Vec<&str> = self.nodes[id]
                    .dependents
                    .iter()
                    .map(String::as_str)
                    .filter(|d| incomplete.contains(d))
                    .collect();
                // Insertion order among newly freed dependents.
                dependents.sort_by_key(|d| self.order.iter().position(|o| o.as_str() == *d));
                for dep in dependents {
                    let entry = indegree.get_mut(dep).unwrap();
                    *entry -= 1;
                    if *entry == 0 {
                        next.push(dep);
                    }
                }
            }
            frontier = next;
        }

        // Longest incoming path; strict comparison keeps the first
        // topological discovery on ties.
        let mut best_len: HashMap<&str, usize> = HashMap::new();
        let mut parent: HashMap<&str, &str> = HashMap::new();
        let mut end: Option<&str> = None;
        for &id in &topo {
            let mut len = 1;
            let mut via: Option<&str> = None;
            let mut preds: Vec<&str> = self.nodes[id]
                .deps
                .iter()
                .map(String::as_str)
                .filter(|d| incomplete.contains(d))
                .collect();
            preds.sort_by_key(|p| position[p]);
            for pred in preds {
                let candidate = best_len[pred] + 1;
                if candidate > len {
                    len = candidate;
                    via = Some(pred);
                }
            }
            best_len.insert(id, len);
            if let Some(v) = via {
                parent.insert(id, v);
            }
            let better = match end {
                None => true,
                Some(e) => len > best_len[e],
            };
            if better {
                end = Some(id);
            }
        }

        let mut path = Vec::new();
        let mut cursor = end;
        while let Some(id) = cursor {
            path.push(id.to_string());
            cursor = parent.get(id).copied();
        }
        path.reverse();
        path
    }

    /// Mark a task completed. Idempotent; unknown ids are ignored so stale
    /// or duplicate completion messages are harmless.
    pub fn mark_completed(&mut self, id: &str) {
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.completed = true;
                node.state = TaskState::Completed;
            }
            None => debug!(task_id = %id, "mark_completed for unknown task ignored"),
        }
    }

    /// Transition a pending task to running.
    pub fn start(&mut self, id: &str) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| SwarmError::TaskNotFound(id.to_string()))?;
        if node.state != TaskState::Pending {
            return Err(SwarmError::Other(format!(
                "task {} is not pending (state: {:?})",
                id, node.state
            )));
        }
        node.state = TaskState::Running;
        Ok(())
    }

    /// Mark a task failed. Dependents stay pending and never become ready.
    pub fn mark_failed(&mut self, id: &str) {
        match self.nodes.get_mut(id) {
            Some(node) => node.state = TaskState::Failed,
            None => debug!(task_id = %id, "mark_failed for unknown task ignored"),
        }
    }

    pub fn all_complete(&self) -> bool {
        self.nodes.values().all(|n| n.completed)
    }

    pub fn task_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn completed_count(&self) -> usize {
        self.nodes.values().filter(|n| n.completed).count()
    }

    pub fn running_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.state == TaskState::Running)
            .count()
    }

    pub fn get(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn state_of(&self, id: &str) -> Option<TaskState> {
        self.nodes.get(id).map(|n| n.state)
    }

    /// All task ids in insertion order.
    pub fn task_ids(&self) -> &[String] {
        &self.order
    }

    pub fn stats(&self) -> GraphStats {
        let mut stats = GraphStats {
            total: self.nodes.len(),
            ..GraphStats::default()
        };
        for node in self.nodes.values() {
            match node.state {
                TaskState::Pending => stats.pending += 1,
                TaskState::Running => stats.running += 1,
                TaskState::Completed => stats.completed += 1,
                TaskState::Failed => stats.failed += 1,
            }
        }
        stats
    }
}
