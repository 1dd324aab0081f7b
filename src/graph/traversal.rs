//! Graph traversals: reachability walks, terminal sets, cycle
//! enumeration and topological ordering
//!
//! All traversals are explicit-stack depth-first searches, generic over
//! the direction: `Outgoing` follows children, `Incoming` follows
//! parents.

use std::collections::HashSet;

use petgraph::Direction;

use super::{JobId, Workflow};

/// Depth-first iterator over the jobs reachable from a set of roots.
///
/// Each reachable job is yielded at most once, roots included.
pub struct Walk<'a> {
    workflow: &'a Workflow,
    direction: Direction,
    stack: Vec<JobId>,
    seen: HashSet<JobId>,
}

impl<'a> Walk<'a> {
    pub(crate) fn new(workflow: &'a Workflow, roots: &[JobId], direction: Direction) -> Self {
        Self {
            workflow,
            direction,
            stack: roots.iter().rev().copied().collect(),
            seen: HashSet::new(),
        }
    }
}

impl Iterator for Walk<'_> {
    type Item = JobId;

    fn next(&mut self) -> Option<JobId> {
        while let Some(id) = self.stack.pop() {
            if !self.seen.insert(id) {
                continue;
            }
            self.stack
                .extend(self.workflow.neighbors(id, self.direction));
            return Some(id);
        }
        None
    }
}

/// The forward-reachable jobs from `roots` that have no children.
pub(crate) fn terminal_jobs(workflow: &Workflow, roots: &[JobId]) -> Vec<JobId> {
    workflow
        .walk(roots, Direction::Outgoing)
        .filter(|&id| workflow.children(id).is_empty())
        .collect()
}

/// Lazy enumerator of the simple cycles reachable from a set of roots.
///
/// The iterator runs a depth-first search and yields, for every back
/// edge it encounters, the nodes along the cycle the back edge closes,
/// starting at the re-entered node. Nodes whose subtree has been fully
/// explored are not revisited, so the search terminates even on dense
/// graphs; a graph is acyclic iff the iterator is immediately exhausted.
pub struct Cycles<'a> {
    workflow: &'a Workflow,
    direction: Direction,
    roots: Vec<JobId>,
    stack: Vec<Frame>,
    path: Vec<JobId>,
    on_path: HashSet<JobId>,
    finished: HashSet<JobId>,
}

struct Frame {
    id: JobId,
    neighbors: Vec<JobId>,
    cursor: usize,
}

impl<'a> Cycles<'a> {
    pub(crate) fn new(workflow: &'a Workflow, roots: &[JobId], direction: Direction) -> Self {
        Self {
            workflow,
            direction,
            roots: roots.iter().rev().copied().collect(),
            stack: Vec::new(),
            path: Vec::new(),
            on_path: HashSet::new(),
            finished: HashSet::new(),
        }
    }

    fn push(&mut self, id: JobId) {
        self.stack.push(Frame {
            id,
            neighbors: self.workflow.neighbors(id, self.direction),
            cursor: 0,
        });
        self.path.push(id);
        self.on_path.insert(id);
    }
}

impl Iterator for Cycles<'_> {
    type Item = Vec<JobId>;

    fn next(&mut self) -> Option<Vec<JobId>> {
        loop {
            if self.stack.is_empty() {
                let root = loop {
                    let candidate = self.roots.pop()?;
                    if !self.finished.contains(&candidate) {
                        break candidate;
                    }
                };
                self.push(root);
            }

            while let Some(frame) = self.stack.last_mut() {
                if frame.cursor < frame.neighbors.len() {
                    let next = frame.neighbors[frame.cursor];
                    frame.cursor += 1;

                    if self.on_path.contains(&next) {
                        let start = self
                            .path
                            .iter()
                            .position(|&id| id == next)
                            .unwrap_or_default();
                        return Some(self.path[start..].to_vec());
                    }
                    if !self.finished.contains(&next) {
                        self.push(next);
                    }
                } else {
                    let done = frame.id;
                    self.stack.pop();
                    self.path.pop();
                    self.on_path.remove(&done);
                    self.finished.insert(done);
                }
            }
        }
    }
}

/// Parents-before-children order over the jobs backward-reachable from
/// `targets`, computed as the postorder of a backward depth-first
/// search. The graph must be acyclic.
pub(crate) fn topological(workflow: &Workflow, targets: &[JobId]) -> Vec<JobId> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut stack: Vec<(JobId, bool)> = targets.iter().rev().map(|&id| (id, false)).collect();

    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            order.push(id);
            continue;
        }
        if !seen.insert(id) {
            continue;
        }
        stack.push((id, true));
        for parent in workflow.neighbors(id, Direction::Incoming) {
            if !seen.contains(&parent) {
                stack.push((parent, false));
            }
        }
    }

    order
}
