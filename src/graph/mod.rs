//! Workflow graph structures and algorithms
//!
//! This module provides the job graph itself along with the traversals
//! and the pruner that rewrites the graph before execution.

use std::fmt;
use std::path::Path;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use thiserror::Error;

pub use petgraph::Direction;

pub mod array;
pub mod condition;
pub mod job;
pub mod prune;
pub mod traversal;

pub use array::ArraySpec;
pub use condition::Condition;
pub use job::{job, Job, JobBody, JobBuilder, Status, WaitMode};
pub use traversal::{Cycles, Walk};

use crate::Result;

/// Errors specific to graph construction.
#[derive(Error, Debug)]
pub enum GraphError {
    /// A job declared a dependency on itself.
    #[error("job `{0}` cannot depend on itself")]
    SelfDependency(String),

    /// A job handle does not belong to this workflow.
    #[error("unknown job handle")]
    UnknownJob,

    /// A job was added without a body.
    #[error("job `{0}` has no body")]
    MissingBody(String),

    /// An indexed body was declared without an array domain.
    #[error("job `{0}` has an indexed body but no array")]
    MissingArray(String),

    /// A plain body was declared together with an array domain.
    #[error("job `{0}` has an array but a zero-argument body")]
    UnexpectedArray(String),

    /// An array domain contains no indices.
    #[error("array of job `{0}` must not be empty")]
    EmptyArray(String),

    /// An indexed condition was attached to a non-array job.
    #[error("job `{0}` is not an array job but has an indexed condition")]
    IndexedCondition(String),

    /// A working directory is not an absolute path.
    #[error("working directory of job `{0}` must be an absolute path")]
    RelativeWorkdir(String),
}

/// Opaque, copyable handle to a job inside a [`Workflow`].
///
/// Handles stay valid for the life of the workflow that issued them:
/// the pruner detaches edges and narrows arrays but never removes nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub(crate) NodeIndex);

impl JobId {
    /// Stable numeric identifier of the job inside its workflow.
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.index())
    }
}

/// A directed acyclic graph of [`Job`]s.
///
/// Edges run from a parent (dependency) to its child (dependent) and are
/// weighted with the [`Status`] gate of the dependency. The two adjacency
/// views handed out by [`parents`](Workflow::parents) and
/// [`children`](Workflow::children) are projections of the same edge
/// store, so they cannot drift apart.
#[derive(Debug, Default)]
pub struct Workflow {
    graph: DiGraph<Job, Status>,
}

impl Workflow {
    /// Create an empty workflow.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
        }
    }

    /// Validate a job builder and add the finished job to the workflow.
    ///
    /// Enforces the decoration-time invariants: a body must be present,
    /// indexed bodies require an array domain and vice versa, arrays must
    /// be non-empty, indexed conditions are only legal on array jobs, and
    /// a `chdir` setting must be absolute. Dependencies accumulated on the
    /// builder are wired before the handle is returned.
    pub fn add(&mut self, builder: JobBuilder) -> Result<JobId> {
        let name = builder.name.clone();

        let body = builder
            .body
            .as_ref()
            .ok_or_else(|| GraphError::MissingBody(name.clone()))?;

        match (&builder.array, body.is_indexed()) {
            (None, true) => return Err(GraphError::MissingArray(name).into()),
            (Some(_), false) => return Err(GraphError::UnexpectedArray(name).into()),
            _ => {}
        }

        if let Some(array) = &builder.array {
            if array.is_empty() {
                return Err(GraphError::EmptyArray(name).into());
            }
        }

        if builder.array.is_none() {
            let indexed = builder
                .preconditions
                .iter()
                .chain(builder.postconditions.iter())
                .any(|condition| condition.is_indexed());
            if indexed {
                return Err(GraphError::IndexedCondition(name).into());
            }
        }

        if let Some(Some(dir)) = builder.settings.get("chdir") {
            if !Path::new(dir).is_absolute() {
                return Err(GraphError::RelativeWorkdir(name).into());
            }
        }

        let dependencies = builder.dependencies.clone();
        let id = JobId(self.graph.add_node(builder.finalize()));

        for (parent, status) in dependencies {
            self.add_dependency(id, parent, status)?;
        }

        Ok(id)
    }

    /// Declare that `child` depends on `parent` with the given status
    /// gate. Re-declaring an existing edge overwrites its status.
    pub fn add_dependency(&mut self, child: JobId, parent: JobId, status: Status) -> Result<()> {
        if child == parent {
            return Err(GraphError::SelfDependency(self.job(child).name().to_string()).into());
        }
        if self.graph.node_weight(parent.0).is_none() || self.graph.node_weight(child.0).is_none() {
            return Err(GraphError::UnknownJob.into());
        }

        self.graph.update_edge(parent.0, child.0, status);
        Ok(())
    }

    /// Remove the dependency edge between `child` and `parent`, if any.
    pub fn detach(&mut self, child: JobId, parent: JobId) {
        if let Some(edge) = self.graph.find_edge(parent.0, child.0) {
            self.graph.remove_edge(edge);
        }
    }

    /// The job behind a handle.
    ///
    /// Panics if the handle was issued by a different workflow.
    pub fn job(&self, id: JobId) -> &Job {
        &self.graph[id.0]
    }

    /// Mutable access to the job behind a handle.
    pub fn job_mut(&mut self, id: JobId) -> &mut Job {
        &mut self.graph[id.0]
    }

    /// The dependencies of a job, with the status gate of each edge.
    pub fn parents(&self, id: JobId) -> Vec<(JobId, Status)> {
        self.graph
            .edges_directed(id.0, Direction::Incoming)
            .map(|edge| (JobId(edge.source()), *edge.weight()))
            .collect()
    }

    /// The dependents of a job, with the status gate of each edge.
    pub fn children(&self, id: JobId) -> Vec<(JobId, Status)> {
        self.graph
            .edges_directed(id.0, Direction::Outgoing)
            .map(|edge| (JobId(edge.target()), *edge.weight()))
            .collect()
    }

    /// Neighbors of a job in the given direction, without edge weights.
    pub fn neighbors(&self, id: JobId, direction: Direction) -> Vec<JobId> {
        self.graph
            .neighbors_directed(id.0, direction)
            .map(JobId)
            .collect()
    }

    /// Handles of every job in the workflow, including detached ones.
    pub fn jobs(&self) -> impl Iterator<Item = JobId> + '_ {
        self.graph.node_indices().map(JobId)
    }

    /// Number of jobs in the workflow.
    pub fn job_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Visit each node reachable from `roots` exactly once, following
    /// children (`Outgoing`) or parents (`Incoming`).
    pub fn walk<'a>(&'a self, roots: &[JobId], direction: Direction) -> Walk<'a> {
        Walk::new(self, roots, direction)
    }

    /// The forward-reachable jobs from `roots` that have no children.
    pub fn terminal_jobs(&self, roots: &[JobId]) -> Vec<JobId> {
        traversal::terminal_jobs(self, roots)
    }

    /// Lazily enumerate the simple cycles reachable from `roots` in the
    /// given direction.
    pub fn cycles<'a>(&'a self, roots: &[JobId], direction: Direction) -> Cycles<'a> {
        Cycles::new(self, roots, direction)
    }

    /// Parents-before-children order over the jobs backward-reachable
    /// from `targets`. The graph must be acyclic.
    pub fn topological(&self, targets: &[JobId]) -> Vec<JobId> {
        traversal::topological(self, targets)
    }

    /// Rewrite the graph in place so that already-done work is elided,
    /// arrays are narrowed to their pending indices and disabled jobs are
    /// bypassed. Returns the entry jobs that still have work to do.
    pub fn prune(&mut self, targets: &[JobId]) -> Vec<JobId> {
        prune::prune(self, targets)
    }
}
