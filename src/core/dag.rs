//! Dependency graph over task ids.
//!
//! Edges point from a dependency to its dependent (`a -> b` means `b`
//! waits for `a`). Tasks are immutable once stored, so the graph only
//! grows; acyclicity is checked on every insertion and never re-validated.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// The task dependency graph.
///
/// Uses a `StableDiGraph` so a rejected batch can be rolled back without
/// invalidating the indices of tasks already stored.
pub struct DependencyGraph {
    graph: StableDiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Insert a batch of tasks with their dependency sets.
    ///
    /// Dependencies may reference tasks already in the graph or other
    /// members of the batch. The batch is inserted atomically: on any
    /// error the graph is left exactly as it was.
    ///
    /// # Errors
    /// Returns `Error::Validation` if an id is already present or repeated,
    /// a dependency is unknown, or an edge would close a cycle.
    pub fn insert_batch(&mut self, entries: &[(TaskId, BTreeSet<TaskId>)]) -> Result<()> {
        let mut batch_ids = HashSet::with_capacity(entries.len());
        for (id, _) in entries {
            if self.index.contains_key(id) || !batch_ids.insert(*id) {
                return Err(Error::Validation(format!("Duplicate task id {}", id)));
            }
        }
        for (id, deps) in entries {
            if let Some(unknown) = deps
                .iter()
                .find(|dep| !self.index.contains_key(dep) && !batch_ids.contains(dep))
            {
                return Err(Error::Validation(format!(
                    "Task {} depends on unknown task {}",
                    id, unknown
                )));
            }
        }

        let added: Vec<NodeIndex> = entries
            .iter()
            .map(|(id, _)| {
                let node = self.graph.add_node(*id);
                self.index.insert(*id, node);
                node
            })
            .collect();

        for (id, deps) in entries {
            for dep in deps {
                if let Err(err) = self.add_edge(dep, id) {
                    self.rollback(&added);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Add `from -> to`, rejecting it if `to` already reaches `from`.
    fn add_edge(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_node = self.index[from];
        let to_node = self.index[to];
        if from_node == to_node || has_path_connecting(&self.graph, to_node, from_node, None) {
            return Err(Error::Validation(format!(
                "Adding dependency from {} to {} would create a cycle",
                from, to
            )));
        }
        self.graph.add_edge(from_node, to_node, ());
        Ok(())
    }

    fn rollback(&mut self, added: &[NodeIndex]) {
        for node in added {
            if let Some(id) = self.graph.remove_node(*node) {
                self.index.remove(&id);
            }
        }
    }

    /// Check whether a task is in the graph.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Get the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependency edges in the graph.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Tasks that `id` depends on.
    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that depend directly on `id`.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n])
            .collect();
        ids.sort();
        ids
    }

    /// Every task that transitively depends on `id`, nearest first.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<TaskId> = self.dependents(id).into();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                order.push(next);
                queue.extend(self.dependents(&next));
            }
        }
        order
    }

    /// Task ids in an order where every task follows its dependencies.
    ///
    /// # Errors
    /// Returns an error if the graph contains a cycle, which insertion
    /// rules out.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            Error::Validation(format!("Cycle detected at task {}", self.graph[cycle.node_id()]))
        })?;
        Ok(sorted.into_iter().map(|n| self.graph[n]).collect())
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
