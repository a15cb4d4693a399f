// src/tree.rs

//! In-memory task graph of one dag instance.
//!
//! Nodes live in an arena and reference each other by index, so the graph
//! can hold both parent and child edges without ownership cycles; the tree
//! is discarded as a whole when the instance leaves memory.
//!
//! A virtual root sits above all start nodes. Its status is permanently
//! `success` so the gating rules below treat real roots like any other
//! node whose parents have finished.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::entity::{Task, TaskInstance, TaskInstanceStatus};
use crate::errors::{FlowError, Result};

pub const VIRTUAL_ROOT_ID: &str = "_virtual_root";

const ROOT: usize = 0;

/// The slice of task state the tree needs: an id to store in the node, the
/// id used for dependency lookup, the dependency list and a status.
///
/// Template tasks (before instances exist) and task instances both qualify.
pub trait TaskView {
    fn node_id(&self) -> &str;
    fn graph_id(&self) -> &str;
    fn depends(&self) -> &[String];
    fn status(&self) -> TaskInstanceStatus;
}

impl TaskView for Task {
    fn node_id(&self) -> &str {
        &self.id
    }
    fn graph_id(&self) -> &str {
        &self.id
    }
    fn depends(&self) -> &[String] {
        &self.depend_on
    }
    fn status(&self) -> TaskInstanceStatus {
        TaskInstanceStatus::Init
    }
}

impl TaskView for TaskInstance {
    fn node_id(&self) -> &str {
        &self.id
    }
    fn graph_id(&self) -> &str {
        &self.task_id
    }
    fn depends(&self) -> &[String] {
        &self.depend_on
    }
    fn status(&self) -> TaskInstanceStatus {
        self.status
    }
}

#[derive(Debug, Clone)]
struct TaskNode {
    task_ins_id: String,
    status: TaskInstanceStatus,
    parents: Vec<usize>,
    children: Vec<usize>,
}

/// Roll-up status of a whole tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeStatus {
    Running,
    Success,
    Failed,
    Blocked,
}

/// Dependency tree of one dag instance.
#[derive(Debug, Clone)]
pub struct TaskTree {
    nodes: Vec<TaskNode>,
}

impl TaskTree {
    /// Build and validate a tree from an ordered sequence of task views.
    ///
    /// Fails with `DuplicateTaskId`, `MissingDependency`, `CycleDetected`
    /// (naming a node inside or downstream of the cycle) or `NoStartNodes`.
    pub fn build<T: TaskView>(tasks: &[T]) -> Result<TaskTree> {
        let mut nodes = vec![TaskNode {
            task_ins_id: VIRTUAL_ROOT_ID.to_string(),
            status: TaskInstanceStatus::Success,
            parents: Vec::new(),
            children: Vec::new(),
        }];

        let mut index: HashMap<&str, usize> = HashMap::new();
        for task in tasks {
            if index.contains_key(task.graph_id()) {
                return Err(FlowError::DuplicateTaskId(task.graph_id().to_string()));
            }
            nodes.push(TaskNode {
                task_ins_id: task.node_id().to_string(),
                status: task.status(),
                parents: Vec::new(),
                children: Vec::new(),
            });
            index.insert(task.graph_id(), nodes.len() - 1);
        }

        for task in tasks {
            let idx = index[task.graph_id()];
            if task.depends().is_empty() {
                nodes[idx].parents.push(ROOT);
                nodes[ROOT].children.push(idx);
                continue;
            }
            for dep in task.depends() {
                let parent = *index.get(dep.as_str()).ok_or_else(|| {
                    FlowError::MissingDependency {
                        task: task.graph_id().to_string(),
                        depend: dep.clone(),
                    }
                })?;
                nodes[parent].children.push(idx);
                nodes[idx].parents.push(parent);
            }
        }

        let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
        for idx in 0..nodes.len() {
            graph.add_node(idx);
        }
        for (idx, node) in nodes.iter().enumerate() {
            for &child in &node.children {
                graph.add_edge(idx, child, ());
            }
        }
        if let Err(cycle) = toposort(&graph, None) {
            let at = nodes[cycle.node_id()].task_ins_id.clone();
            return Err(FlowError::CycleDetected(at));
        }

        if nodes[ROOT].children.is_empty() {
            return Err(FlowError::NoStartNodes);
        }

        Ok(TaskTree { nodes })
    }

    fn can_execute_child(&self, idx: usize) -> bool {
        matches!(
            self.nodes[idx].status,
            TaskInstanceStatus::Success | TaskInstanceStatus::Skipped
        )
    }

    fn can_be_executed(&self, idx: usize) -> bool {
        let node = &self.nodes[idx];
        node.parents.iter().all(|&p| self.can_execute_child(p))
    }

    fn executable(&self, idx: usize) -> bool {
        matches!(
            self.nodes[idx].status,
            TaskInstanceStatus::Init | TaskInstanceStatus::Retrying | TaskInstanceStatus::Ending
        ) && self.can_be_executed(idx)
    }

    /// Gated depth-first walk. The visitor returns `false` to stop the
    /// whole walk. Subtrees below a node that cannot execute children are
    /// skipped; multi-parent nodes are only entered once all their parents
    /// allow it. The virtual root is never visited.
    fn walk(&self, mut visit: impl FnMut(usize, &TaskNode) -> bool) {
        self.dfs(ROOT, &mut visit);
    }

    fn dfs(&self, idx: usize, visit: &mut impl FnMut(usize, &TaskNode) -> bool) -> bool {
        let node = &self.nodes[idx];
        if idx != ROOT && !visit(idx, node) {
            return false;
        }

        // We cannot execute children, but sibling branches still walk.
        if !self.can_execute_child(idx) {
            return true;
        }
        for &child in &node.children {
            if self.nodes[child].parents.len() > 1 && !self.can_be_executed(child) {
                continue;
            }
            if !self.dfs(child, visit) {
                return false;
            }
        }
        true
    }

    /// Ids of every task that may execute right now: status is
    /// init/retrying/ending and every parent is success or skipped.
    pub fn executable_task_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut executables = Vec::new();
        self.walk(|idx, node| {
            if self.executable(idx) && seen.insert(idx) {
                executables.push(node.task_ins_id.clone());
            }
            true
        });
        executables
    }

    /// Record the final state of one task instance and return what may run
    /// next: the task itself when it moved back to `init` (a retry
    /// re-enqueue), otherwise the direct children that became executable.
    ///
    /// The `bool` reports whether the task was found in the tree at all.
    pub fn next_task_ids(&mut self, completed: &TaskInstance) -> (Vec<String>, bool) {
        let mut found = None;
        self.walk(|idx, node| {
            if node.task_ins_id == completed.id {
                found = Some(idx);
                return false;
            }
            true
        });
        let Some(idx) = found else {
            return (Vec::new(), false);
        };

        self.nodes[idx].status = completed.status;

        if completed.status == TaskInstanceStatus::Init {
            return (vec![self.nodes[idx].task_ins_id.clone()], true);
        }
        if !self.can_execute_child(idx) {
            return (Vec::new(), true);
        }

        let children = self.nodes[idx].children.clone();
        let executable = children
            .into_iter()
            .filter(|&c| self.executable(c))
            .map(|c| self.nodes[c].task_ins_id.clone())
            .collect();
        (executable, true)
    }

    /// Roll-up status of the tree, decided by the first node in DFS order
    /// that is not success/skipped; ties break deterministically because
    /// children keep insertion order.
    pub fn compute_status(&self) -> (TreeStatus, Option<String>) {
        let mut status = TreeStatus::Success;
        let mut src = None;
        self.walk(|_, node| match node.status {
            TaskInstanceStatus::Failed | TaskInstanceStatus::Canceled => {
                status = TreeStatus::Failed;
                src = Some(node.task_ins_id.clone());
                false
            }
            TaskInstanceStatus::Blocked => {
                status = TreeStatus::Blocked;
                src = Some(node.task_ins_id.clone());
                false
            }
            TaskInstanceStatus::Success | TaskInstanceStatus::Skipped => true,
            _ => {
                status = TreeStatus::Running;
                src = Some(node.task_ins_id.clone());
                false
            }
        });

        match src {
            Some(id) => (status, Some(id)),
            None => (TreeStatus::Success, None),
        }
    }
}
