use super::references;
use crate::error::GraphError;
use crate::sandbox::CONTEXT_BINDING;
use crate::types::{TaskName, WorkflowSpec};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};

/// Validated dependency graph of a workflow
#[derive(Debug, Clone)]
pub struct TaskGraph {
    graph: DiGraph<TaskName, ()>,
    indices: HashMap<TaskName, NodeIndex>,
}

impl TaskGraph {
    /// Build and validate the dependency graph of a workflow
    pub fn from_spec(spec: &WorkflowSpec) -> Result<Self, GraphError> {
        if spec.tasks.is_empty() {
            return Err(GraphError::Validation("workflow has no tasks".into()));
        }

        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        for (name, task) in &spec.tasks {
            if name.as_str().trim().is_empty() {
                return Err(GraphError::Validation("task names must not be empty".into()));
            }
            if task.tool.trim().is_empty() {
                return Err(GraphError::Validation(format!("task {} has no tool", name)));
            }
            if task
                .params
                .get(CONTEXT_BINDING)
                .is_some_and(|c| !c.is_object() && !c.is_null())
            {
                return Err(GraphError::Validation(format!(
                    "task {} has a {} param that is not an object",
                    name, CONTEXT_BINDING
                )));
            }
            let node = graph.add_node(name.clone());
            indices.insert(name.clone(), node);
        }

        for (name, task) in &spec.tasks {
            let task_idx = indices[name];
            for dep in &task.dependencies {
                if dep == name {
                    return Err(GraphError::CyclicDependency {
                        cycle: vec![name.clone()],
                    });
                }
                let dep_idx = indices.get(dep).ok_or_else(|| GraphError::UnknownDependency {
                    task: name.clone(),
                    dependency: dep.clone(),
                })?;

                // Edge from dependency to dependent (dep -> task)
                graph.update_edge(*dep_idx, task_idx, ());
            }
        }

        if let Some(cycle) = petgraph::algo::tarjan_scc(&graph)
            .into_iter()
            .find(|component| component.len() > 1)
        {
            let mut cycle: Vec<TaskName> = cycle.into_iter().map(|n| graph[n].clone()).collect();
            cycle.sort();
            return Err(GraphError::CyclicDependency { cycle });
        }

        for (name, task) in &spec.tasks {
            for reference in references::collect(&task.params) {
                if !task.dependencies.contains(&reference.task) {
                    return Err(GraphError::Validation(format!(
                        "task {} references the output of {} without depending on it",
                        name, reference.task
                    )));
                }
            }
        }

        Ok(Self { graph, indices })
    }

    /// Direct dependencies of a task, sorted by name
    pub fn dependencies(&self, name: &TaskName) -> Vec<TaskName> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Tasks that directly depend on the given task, sorted by name
    pub fn dependents(&self, name: &TaskName) -> Vec<TaskName> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Every task reachable downstream of the given task, excluding itself
    pub fn descendants(&self, name: &TaskName) -> BTreeSet<TaskName> {
        let Some(&start) = self.indices.get(name) else {
            return BTreeSet::new();
        };
        let mut bfs = Bfs::new(&self.graph, start);
        let mut found = BTreeSet::new();
        while let Some(node) = bfs.next(&self.graph) {
            if node != start {
                found.insert(self.graph[node].clone());
            }
        }
        found
    }

    /// Tasks with no dependencies, sorted by name
    pub fn entry_tasks(&self) -> Vec<TaskName> {
        let mut entries: Vec<TaskName> = self
            .graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| self.graph[n].clone())
            .collect();
        entries.sort();
        entries
    }

    fn neighbors(&self, name: &TaskName, direction: Direction) -> Vec<TaskName> {
        let Some(&node) = self.indices.get(name) else {
            return Vec::new();
        };
        let mut names: Vec<TaskName> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        names.sort();
        names
    }
}
