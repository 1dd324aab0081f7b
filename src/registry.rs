//! Process-global task registry
//!
//! The cluster backend cannot ship closures across process boundaries, so
//! jobs are transported by reference instead: at emission time each job's
//! executable parts are registered under a per-run-stable token, the token
//! is written to a payload file next to the submission script, and the
//! subordinate processor resolves the token against this registry after
//! the pipeline binary has rebuilt its workflow.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::graph::{Condition, JobBody};

lazy_static! {
    static ref REGISTRY: DashMap<String, Arc<Task>> = DashMap::new();
}

/// Errors raised while executing a task body.
#[derive(Error, Debug)]
pub enum TaskError {
    /// A precondition of the job did not hold.
    #[error("precondition of job `{job}` not satisfied")]
    PreconditionViolated {
        /// Name of the failing job.
        job: String,
        /// Array index being executed, if any.
        index: Option<u32>,
    },

    /// A postcondition of the job did not hold after the body ran.
    #[error("job `{job}` does not satisfy its postcondition")]
    PostconditionViolated {
        /// Name of the failing job.
        job: String,
        /// Array index being executed, if any.
        index: Option<u32>,
    },

    /// The body was invoked with the wrong number of arguments.
    #[error("job `{job}` was invoked with the wrong arity")]
    Arity {
        /// Name of the failing job.
        job: String,
    },

    /// The user body returned an error.
    #[error("job `{job}` failed: {error}")]
    Failed {
        /// Name of the failing job.
        job: String,
        /// The error returned by the body.
        error: anyhow::Error,
    },
}

/// The executable parts of a job: its body and the conditions evaluated
/// around it.
///
/// Both backends run jobs through [`Task::call`], so pre- and
/// postcondition semantics are identical locally and inside a cluster
/// allocation.
#[derive(Clone)]
pub struct Task {
    name: String,
    body: JobBody,
    preconditions: Vec<Condition>,
    postconditions: Vec<Condition>,
}

impl Task {
    pub(crate) fn new(
        name: String,
        body: JobBody,
        preconditions: Vec<Condition>,
        postconditions: Vec<Condition>,
    ) -> Self {
        Self {
            name,
            body,
            preconditions,
            postconditions,
        }
    }

    /// Name of the job this task was snapshotted from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the task: preconditions, body, postconditions, in that order.
    ///
    /// `index` carries the array index for array jobs and must be absent
    /// for plain jobs.
    pub fn call(&self, index: Option<u32>) -> Result<Value, TaskError> {
        for condition in &self.preconditions {
            if !condition.eval(index) {
                return Err(TaskError::PreconditionViolated {
                    job: self.name.clone(),
                    index,
                });
            }
        }

        let value = match (&self.body, index) {
            (JobBody::Plain(body), None) => body(),
            (JobBody::Indexed(body), Some(i)) => body(i),
            _ => {
                return Err(TaskError::Arity {
                    job: self.name.clone(),
                })
            }
        }
        .map_err(|error| TaskError::Failed {
            job: self.name.clone(),
            error,
        })?;

        for condition in &self.postconditions {
            if !condition.eval(index) {
                return Err(TaskError::PostconditionViolated {
                    job: self.name.clone(),
                    index,
                });
            }
        }

        Ok(value)
    }
}

/// Register a task under a token, replacing any previous registration.
pub fn register(token: impl Into<String>, task: Task) {
    REGISTRY.insert(token.into(), Arc::new(task));
}

/// Look up a task by its token.
pub fn resolve(token: &str) -> Option<Arc<Task>> {
    REGISTRY.get(token).map(|entry| entry.value().clone())
}

/// On-disk reference to a registered task, written next to each
/// submission script by the cluster emitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    /// Registry token the processor resolves.
    pub token: String,

    /// Name of the job, for diagnostics.
    pub job: String,
}

impl TaskRef {
    /// Serialize the reference to a payload file.
    pub fn write(&self, path: &Path) -> crate::Result<()> {
        let bytes = bincode::serialize(self)?;
        fs::write(path, bytes)?;
        Ok(())
    }

    /// Deserialize a reference from a payload file.
    pub fn read(path: &Path) -> crate::Result<Self> {
        let bytes = fs::read(path)?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn plain_task(name: &str) -> Task {
        Task::new(
            name.to_string(),
            JobBody::Plain(Arc::new(|| Ok(json!("done")))),
            Vec::new(),
            Vec::new(),
        )
    }

    #[test]
    fn test_call_runs_body() {
        let value = plain_task("t").call(None).unwrap();
        assert_eq!(value, json!("done"));
    }

    #[test]
    fn test_call_rejects_wrong_arity() {
        let error = plain_task("t").call(Some(1)).unwrap_err();
        assert!(matches!(error, TaskError::Arity { .. }));
    }

    #[test]
    fn test_preconditions_run_before_body() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = invocations.clone();
        let task = Task::new(
            "guarded".to_string(),
            JobBody::Plain(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            })),
            vec![Condition::new(|| false)],
            Vec::new(),
        );

        let error = task.call(None).unwrap_err();
        assert!(matches!(error, TaskError::PreconditionViolated { .. }));
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_postcondition_failure() {
        let task = Task::new(
            "broken".to_string(),
            JobBody::Plain(Arc::new(|| Ok(json!(null)))),
            Vec::new(),
            vec![Condition::new(|| false)],
        );
        let error = task.call(None).unwrap_err();
        assert!(matches!(error, TaskError::PostconditionViolated { .. }));
    }

    #[test]
    fn test_register_and_resolve() {
        register("registry_test_token", plain_task("t"));
        let task = resolve("registry_test_token").unwrap();
        assert_eq!(task.name(), "t");
        assert!(resolve("registry_test_unknown").is_none());
    }
}
