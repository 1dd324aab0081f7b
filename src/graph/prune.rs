//! Graph pruning: elide finished work before scheduling
//!
//! The pruner rewrites a workflow in place under four rules: disabled
//! jobs are bypassed (their parents reattach to their dependents), jobs
//! whose postconditions already hold are detached from their dependents,
//! arrays are narrowed to the indices whose postconditions do not hold
//! yet, and `waitfor(any)` jobs drop all dependencies once a single one
//! is satisfied. Running the pruner twice yields the same graph as
//! running it once.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::{ArraySpec, JobId, Status, WaitMode, Workflow};

/// Prune the graph backward from the given entry jobs and return the
/// entries that still have work to do, in argument order.
pub(crate) fn prune(workflow: &mut Workflow, targets: &[JobId]) -> Vec<JobId> {
    let mut pruner = Pruner {
        workflow,
        visited: HashSet::new(),
        done: HashMap::new(),
    };

    for &target in targets {
        pruner.visit(target);
    }

    targets
        .iter()
        .copied()
        .filter(|&target| !pruner.is_done(target))
        .collect()
}

struct Pruner<'a> {
    workflow: &'a mut Workflow,
    visited: HashSet<JobId>,
    done: HashMap<JobId, bool>,
}

impl Pruner<'_> {
    fn visit(&mut self, id: JobId) {
        if !self.visited.insert(id) {
            return;
        }

        self.bypass_disabled(id);
        self.trim_satisfied(id);

        for (parent, _) in self.workflow.parents(id) {
            self.visit(parent);
        }

        self.narrow_array(id);
    }

    /// Detach disabled parents and reattach their own parents in their
    /// place, keeping each grandparent's edge status. Repeats until no
    /// direct parent is disabled, so chains of disabled jobs are
    /// transparent as well.
    fn bypass_disabled(&mut self, id: JobId) {
        loop {
            let parents = self.workflow.parents(id);
            let disabled: Vec<JobId> = parents
                .into_iter()
                .filter(|&(parent, _)| self.workflow.job(parent).disabled())
                .map(|(parent, _)| parent)
                .collect();

            if disabled.is_empty() {
                return;
            }

            for parent in disabled {
                let grandparents = self.workflow.parents(parent);
                self.workflow.detach(id, parent);
                debug!(
                    job = self.workflow.job(id).name(),
                    bypassed = self.workflow.job(parent).name(),
                    "bypassing disabled dependency"
                );
                for (grandparent, status) in grandparents {
                    if grandparent != id {
                        // The edge cannot fail: both handles exist and a
                        // self-edge is excluded above.
                        let _ = self.workflow.add_dependency(id, grandparent, status);
                    }
                }
            }
        }
    }

    /// Drop dependencies that are already satisfied by their
    /// postconditions. A done parent satisfies any edge that does not
    /// require a failure; under `waitfor(any)` one satisfied dependency
    /// releases all of them.
    fn trim_satisfied(&mut self, id: JobId) {
        let parents = self.workflow.parents(id);
        let resolved: Vec<JobId> = parents
            .into_iter()
            .filter(|&(parent, status)| status != Status::Failure && self.is_done(parent))
            .map(|(parent, _)| parent)
            .collect();

        match self.workflow.job(id).wait_mode() {
            WaitMode::Any if !resolved.is_empty() => {
                for (parent, _) in self.workflow.parents(id) {
                    self.workflow.detach(id, parent);
                }
            }
            WaitMode::All => {
                for parent in resolved {
                    self.workflow.detach(id, parent);
                }
            }
            _ => {}
        }
    }

    /// Replace an array job's domain with the indices whose
    /// postconditions do not hold yet. An array whose every index is
    /// satisfied marks the whole job done.
    fn narrow_array(&mut self, id: JobId) {
        let job = self.workflow.job(id);
        if job.postconditions().is_empty() {
            return;
        }
        let Some(array) = job.array() else {
            return;
        };

        let pending: Vec<u32> = array
            .indices()
            .into_iter()
            .filter(|&i| !job.is_done_at(i))
            .collect();

        if pending.len() == array.len() {
            return;
        }

        if pending.is_empty() {
            self.done.insert(id, true);
        } else {
            debug!(
                job = self.workflow.job(id).name(),
                pending = pending.len(),
                "narrowing array to pending indices"
            );
            self.workflow
                .job_mut(id)
                .set_array(ArraySpec::Set(pending));
        }
    }

    fn is_done(&mut self, id: JobId) -> bool {
        if let Some(&done) = self.done.get(&id) {
            return done;
        }
        let done = self.workflow.job(id).is_done();
        self.done.insert(id, done);
        done
    }
}
