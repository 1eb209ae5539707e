//! Task graph (directed acyclic graph) for dependency management.
//!
//! `TaskGraph` owns every task of one project and the dependency edges
//! between them. An edge `a -> b` means `a` must complete before `b` can
//! start. The graph rejects any insertion that would introduce a cycle and
//! computes the ready set on demand.

use crate::agent::AgentId;
use crate::core::task::{Task, TaskId, TaskKind, TaskResult, TaskStatus};
use crate::error::{Error, Result};
use chrono::Utc;
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use petgraph::Direction;
use std::collections::HashMap;
use tracing::{debug, warn};

/// The task dependency graph of a single project.
///
/// Uses petgraph's DiGraph. Nodes are never removed once a batch is
/// accepted, so `NodeIndex` order doubles as insertion order for the
/// dispatch tie-break.
pub struct TaskGraph {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Create a new empty TaskGraph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Add a task that depends on the given existing tasks.
    ///
    /// The task is inserted with status Pending.
    ///
    /// # Errors
    /// - `Validation` if a task with the same id already exists
    /// - `TaskNotFound` if a dependency is not in the graph
    /// - `DependencyCycle` if the edges would create a cycle
    pub fn add_task(&mut self, task: Task, dependencies: &[TaskId]) -> Result<TaskId> {
        let mut ids = self.add_batch(vec![(task, dependencies.to_vec())])?;
        Ok(ids.remove(0))
    }

    /// Add several tasks atomically.
    ///
    /// Dependencies may point at tasks already in the graph or at other
    /// tasks in the same batch. Either every task of the batch is inserted
    /// or none is.
    pub fn add_batch(&mut self, batch: Vec<(Task, Vec<TaskId>)>) -> Result<Vec<TaskId>> {
        let mut added: Vec<NodeIndex> = Vec::with_capacity(batch.len());
        let mut edges: Vec<(TaskId, TaskId)> = Vec::new();

        for (mut task, deps) in batch {
            if self.task_index.contains_key(&task.id) {
                self.rollback(&added);
                return Err(Error::Validation(format!(
                    "Task {} already exists in graph",
                    task.id
                )));
            }
            task.status = TaskStatus::Pending;
            let id = task.id;
            let index = self.graph.add_node(task);
            self.task_index.insert(id, index);
            added.push(index);
            edges.extend(deps.into_iter().map(|dep| (dep, id)));
        }

        for (from, to) in edges {
            let (Some(&from_index), Some(&to_index)) =
                (self.task_index.get(&from), self.task_index.get(&to))
            else {
                self.rollback(&added);
                return Err(Error::TaskNotFound { id: from });
            };
            self.graph.update_edge(from_index, to_index, ());
        }

        if let Err(cycle) = toposort(&self.graph, None) {
            let task = self.graph[cycle.node_id()].name.clone();
            self.rollback(&added);
            warn!("Rejected task batch: cycle through '{}'", task);
            return Err(Error::DependencyCycle { task });
        }

        debug!("Added {} task(s) to graph", added.len());
        Ok(added.iter().map(|&index| self.graph[index].id).collect())
    }

    /// Remove freshly added nodes, newest first.
    ///
    /// petgraph moves the last node into a removed slot; removing from
    /// the end keeps every older index stable.
    fn rollback(&mut self, added: &[NodeIndex]) {
        for &index in added.iter().rev() {
            if let Some(task) = self.graph.remove_node(index) {
                self.task_index.remove(&task.id);
            }
        }
    }

    /// Add a dependency between two existing tasks.
    ///
    /// `from` must complete before `to` can start.
    ///
    /// # Errors
    /// Returns an error if either task is missing or if the edge would
    /// create a cycle. The graph is unchanged on error.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_index = *self
            .task_index
            .get(from)
            .ok_or(Error::TaskNotFound { id: *from })?;
        let to_index = *self
            .task_index
            .get(to)
            .ok_or(Error::TaskNotFound { id: *to })?;

        // Temporarily add the edge to check for cycles
        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::DependencyCycle {
                task: self.graph[to_index].name.clone(),
            });
        }
        Ok(())
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        let index = *self
            .task_index
            .get(id)
            .ok_or(Error::TaskNotFound { id: *id })?;
        Ok(&mut self.graph[index])
    }

    /// Get the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependency edges.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Check if `to` directly depends on `from`.
    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&from_idx), Some(&to_idx)) => self.graph.find_edge(from_idx, to_idx).is_some(),
            _ => false,
        }
    }

    /// All tasks, in insertion order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    /// Tasks the given task depends on (predecessors).
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that depend on the given task (successors).
    pub fn dependents_of(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .map(|n| &self.graph[n])
                .collect(),
            None => Vec::new(),
        }
    }

    fn deps_completed(&self, index: NodeIndex) -> bool {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .all(|dep| self.graph[dep].is_completed())
    }

    // ========== Scheduling Operations ==========

    /// Get all tasks that may be dispatched now.
    ///
    /// A task qualifies when it is Pending or Ready and every dependency is
    /// Completed. The result is ordered by priority, then insertion order.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        let mut ready: Vec<(NodeIndex, &Task)> = self
            .graph
            .node_indices()
            .filter_map(|index| {
                let task = &self.graph[index];
                (task.is_open() && self.deps_completed(index)).then_some((index, task))
            })
            .collect();
        ready.sort_by_key(|(index, task)| (task.priority, index.index()));
        ready.into_iter().map(|(_, task)| task).collect()
    }

    /// Promote every Pending task whose dependencies are satisfied to Ready.
    ///
    /// Returns the ids that changed status.
    pub fn promote_ready(&mut self) -> Vec<TaskId> {
        let promotable: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&index| {
                self.graph[index].status == TaskStatus::Pending && self.deps_completed(index)
            })
            .collect();
        promotable
            .into_iter()
            .map(|index| {
                let task = &mut self.graph[index];
                task.status = TaskStatus::Ready;
                task.id
            })
            .collect()
    }

    /// Hand a ready task to an agent.
    pub fn mark_assigned(&mut self, id: &TaskId, agent_id: &AgentId) -> Result<()> {
        let index = *self
            .task_index
            .get(id)
            .ok_or(Error::TaskNotFound { id: *id })?;
        let deps_done = self.deps_completed(index);
        let task = &mut self.graph[index];
        if !task.is_open() || !deps_done {
            return Err(invalid(task, "assigned"));
        }
        task.status = TaskStatus::Assigned;
        task.assigned_agent = Some(agent_id.clone());
        task.started_at = Some(Utc::now());
        Ok(())
    }

    /// Record that the assigned agent has started work.
    pub fn mark_running(&mut self, id: &TaskId) -> Result<()> {
        let task = self.task_mut(id)?;
        match task.status {
            TaskStatus::Assigned | TaskStatus::Running => {
                task.status = TaskStatus::Running;
                Ok(())
            }
            _ => Err(invalid(task, "running")),
        }
    }

    /// Mark an in-flight task as completed.
    ///
    /// Returns the dependents that became Ready as a result.
    pub fn mark_completed(&mut self, id: &TaskId, result: TaskResult) -> Result<Vec<TaskId>> {
        let index = *self
            .task_index
            .get(id)
            .ok_or(Error::TaskNotFound { id: *id })?;
        {
            let task = &mut self.graph[index];
            if !task.is_in_flight() {
                return Err(invalid(task, "completed"));
            }
            task.status = TaskStatus::Completed;
            task.result = Some(result);
            task.completed_at = Some(Utc::now());
        }

        let dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        let mut unlocked = Vec::new();
        for dep in dependents {
            if self.graph[dep].status == TaskStatus::Pending && self.deps_completed(dep) {
                let task = &mut self.graph[dep];
                task.status = TaskStatus::Ready;
                unlocked.push(task.id);
            }
        }
        Ok(unlocked)
    }

    /// Count a failed attempt against the task's retry budget.
    ///
    /// Returns the new attempt count.
    pub fn record_attempt(&mut self, id: &TaskId, error: &str) -> Result<u32> {
        let task = self.task_mut(id)?;
        task.attempt_count += 1;
        task.last_error = Some(error.to_string());
        Ok(task.attempt_count)
    }

    /// Put an in-flight task back into the ready set for another attempt.
    pub fn requeue(&mut self, id: &TaskId) -> Result<()> {
        let task = self.task_mut(id)?;
        if !task.is_in_flight() {
            return Err(invalid(task, "ready"));
        }
        task.status = TaskStatus::Ready;
        task.assigned_agent = None;
        Ok(())
    }

    /// Mark a task as permanently failed and block its transitive dependents.
    ///
    /// Returns the ids of tasks that became Blocked.
    pub fn mark_failed(&mut self, id: &TaskId, error: &str) -> Result<Vec<TaskId>> {
        let index = *self
            .task_index
            .get(id)
            .ok_or(Error::TaskNotFound { id: *id })?;
        let name = {
            let task = &mut self.graph[index];
            if task.is_finished() {
                return Err(invalid(task, "failed"));
            }
            task.status = TaskStatus::Failed {
                error: error.to_string(),
            };
            task.last_error = Some(error.to_string());
            task.completed_at = Some(Utc::now());
            task.name.clone()
        };

        let mut blocked = Vec::new();
        let mut bfs = Bfs::new(&self.graph, index);
        while let Some(next) = bfs.next(&self.graph) {
            if next == index {
                continue;
            }
            let task = &mut self.graph[next];
            if task.is_completed() || task.is_finished() {
                continue;
            }
            task.status = TaskStatus::Blocked {
                reason: format!("dependency '{}' failed", name),
            };
            blocked.push(task.id);
        }
        if !blocked.is_empty() {
            warn!(
                "Task '{}' failed; blocked {} dependent task(s)",
                name,
                blocked.len()
            );
        }
        Ok(blocked)
    }

    /// Block every task that has not reached a terminal state.
    ///
    /// Returns each blocked task with the agent it was assigned to, if any.
    pub fn block_open(&mut self, reason: &str) -> Vec<(TaskId, Option<AgentId>)> {
        let mut blocked = Vec::new();
        for task in self.graph.node_weights_mut() {
            if task.is_finished() {
                continue;
            }
            let agent = if task.is_in_flight() {
                task.assigned_agent.clone()
            } else {
                None
            };
            task.status = TaskStatus::Blocked {
                reason: reason.to_string(),
            };
            blocked.push((task.id, agent));
        }
        blocked
    }

    /// True when every task is Completed.
    pub fn is_resolved(&self) -> bool {
        self.graph.node_weights().all(Task::is_completed)
    }

    /// True when every task of the given kind is Completed.
    pub fn is_kind_resolved(&self, kind: TaskKind) -> bool {
        self.graph
            .node_weights()
            .filter(|t| t.kind == kind)
            .all(Task::is_completed)
    }

    /// True when a task has failed or been blocked and nothing else can move.
    pub fn is_blocked(&self) -> bool {
        let any_dead = self
            .graph
            .node_weights()
            .any(|t| matches!(t.status, TaskStatus::Failed { .. } | TaskStatus::Blocked { .. }));
        if !any_dead {
            return false;
        }
        let in_flight = self.graph.node_weights().any(Task::is_in_flight);
        !in_flight && self.ready_tasks().is_empty()
    }

    /// Tasks of the given kind and round.
    pub fn tasks_in_round(&self, kind: TaskKind, round: u32) -> Vec<&Task> {
        self.graph
            .node_weights()
            .filter(|t| t.kind == kind && t.round == round)
            .collect()
    }

    /// Get tasks in topological order (respecting dependencies).
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| Error::DependencyCycle {
            task: self.graph[cycle.node_id()].name.clone(),
        })?;
        Ok(sorted.into_iter().map(|index| &self.graph[index]).collect())
    }

    /// Number of tasks not yet Completed.
    pub fn pending_count(&self) -> usize {
        self.graph
            .node_weights()
            .filter(|t| !t.is_completed())
            .count()
    }
}

fn invalid(task: &Task, to: &str) -> Error {
    Error::InvalidTaskTransition {
        task: task.id,
        from: task.status.name().to_string(),
        to: to.to_string(),
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
