//! Local backend: a cooperative concurrent execution engine
//!
//! Every job is materialized as one shared future. The future first
//! awaits the job's dependency edges with the per-edge status gating,
//! then runs the body on the blocking worker pool. Futures are memoized
//! per job, so a diamond dependency resolves its apex exactly once, and
//! they always *resolve* rather than propagate a panic or error: a
//! failure becomes the future's value, which is what lets downstream
//! `failure` and `any` edges observe it without collapsing the schedule.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task;
use tracing::debug;

use crate::graph::{ArraySpec, JobId, Status, WaitMode, Workflow};
use crate::registry::{Task, TaskError};
use crate::scheduler::{Executor, ScheduleOutput};
use crate::Result;

/// Ways a job can fail. Failures are values: they resolve a job's
/// future instead of being raised, and downstream edges inspect them.
#[derive(Error, Debug)]
pub enum JobFailure {
    /// The user body returned an error or panicked.
    #[error("job `{job}` failed: {error}")]
    Failed {
        /// Name of the failing job.
        job: String,
        /// The underlying error.
        error: anyhow::Error,
    },

    /// A precondition did not hold before the body ran.
    #[error("precondition of job `{job}` not satisfied")]
    PreconditionViolated {
        /// Name of the failing job.
        job: String,
        /// Array index being executed, if any.
        index: Option<u32>,
    },

    /// A postcondition did not hold after the body ran.
    #[error("job `{job}` does not satisfy its postcondition")]
    PostconditionViolated {
        /// Name of the failing job.
        job: String,
        /// Array index being executed, if any.
        index: Option<u32>,
    },

    /// A `failure`-gated dependency completed successfully.
    #[error("job `{parent}` did not fail")]
    JobNotFailed {
        /// Name of the dependency that was expected to fail.
        parent: String,
    },

    /// The job's dependency gate can no longer be satisfied.
    #[error("dependency of job `{job}` was never satisfied")]
    DependencyNeverSatisfied {
        /// Name of the aborted job.
        job: String,
        /// The condition failure that caused the abort, if any.
        cause: Option<Arc<JobFailure>>,
    },
}

impl JobFailure {
    /// The chained failure this one was caused by, if any.
    pub fn cause(&self) -> Option<&JobFailure> {
        match self {
            JobFailure::DependencyNeverSatisfied { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }
}

impl From<TaskError> for JobFailure {
    fn from(error: TaskError) -> Self {
        match error {
            TaskError::PreconditionViolated { job, index } => {
                JobFailure::PreconditionViolated { job, index }
            }
            TaskError::PostconditionViolated { job, index } => {
                JobFailure::PostconditionViolated { job, index }
            }
            TaskError::Arity { job } => {
                let error = anyhow!("job `{job}` was invoked with the wrong arity");
                JobFailure::Failed { job, error }
            }
            TaskError::Failed { job, error } => JobFailure::Failed { job, error },
        }
    }
}

/// Outcome of a job: its returned value, or the failure it resolved to.
pub type JobResult = std::result::Result<Value, Arc<JobFailure>>;

/// Memoized, cloneable handle to a job's in-flight execution.
pub type JobFuture = Shared<BoxFuture<'static, JobResult>>;

/// Options of the local backend.
#[derive(Debug, Clone)]
pub struct LocalOptions {
    /// Maximum number of job bodies running concurrently on the worker
    /// pool. Defaults to the number of CPUs.
    pub workers: usize,
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
        }
    }
}

/// Cooperative scheduler driving a workflow to completion in-process.
pub struct LocalScheduler {
    workers: Arc<Semaphore>,
    submissions: Mutex<HashMap<JobId, JobFuture>>,
}

impl LocalScheduler {
    /// Create a scheduler with the given options.
    pub fn new(options: LocalOptions) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(options.workers.max(1))),
            submissions: Mutex::new(HashMap::new()),
        }
    }

    /// Submit a job, returning its memoized future.
    ///
    /// Repeated submissions of the same job share one in-flight future.
    /// The futures of all transitive dependencies are created eagerly,
    /// parents before children, so a job's future only ever awaits
    /// futures that already exist.
    pub fn submit(&self, workflow: &Workflow, id: JobId) -> JobFuture {
        let mut submissions = self.submissions.lock();

        if let Some(existing) = submissions.get(&id) {
            return existing.clone();
        }

        for step in workflow.topological(&[id]) {
            if submissions.contains_key(&step) {
                continue;
            }

            let parents: Vec<ParentEdge> = workflow
                .parents(step)
                .into_iter()
                .map(|(parent, status)| ParentEdge {
                    future: submissions[&parent].clone(),
                    name: workflow.job(parent).name().to_string(),
                    status,
                })
                .collect();

            let job = workflow.job(step);
            let spec = JobSpec {
                name: job.name().to_string(),
                wait_mode: job.wait_mode(),
                array: job.array().cloned(),
                task: Arc::new(job.task()),
            };

            debug!(job = spec.name.as_str(), "submitting job");
            let future = run_job(spec, parents, self.workers.clone())
                .boxed()
                .shared();
            submissions.insert(step, future);
        }

        submissions[&id].clone()
    }

    /// Concurrently submit the given jobs and await their results, in
    /// argument order.
    pub async fn gather(&self, workflow: &Workflow, targets: &[JobId]) -> Vec<JobResult> {
        let futures: Vec<JobFuture> = targets
            .iter()
            .map(|&id| self.submit(workflow, id))
            .collect();
        join_all(futures).await
    }
}

#[async_trait]
impl Executor for LocalScheduler {
    async fn execute(&self, workflow: Workflow, targets: Vec<JobId>) -> Result<ScheduleOutput> {
        Ok(ScheduleOutput::Local(
            self.gather(&workflow, &targets).await,
        ))
    }
}

/// Everything a job future needs, snapshotted before execution starts;
/// the graph itself is not touched once futures are running.
struct JobSpec {
    name: String,
    wait_mode: WaitMode,
    array: Option<ArraySpec>,
    task: Arc<Task>,
}

struct ParentEdge {
    future: JobFuture,
    name: String,
    status: Status,
}

/// Await a single dependency edge.
///
/// A completed parent satisfies `success` and `any` edges and fails a
/// `failure` edge; a failed parent satisfies `failure` and `any` edges
/// and re-raises its failure through a `success` edge.
async fn condition(edge: ParentEdge) -> std::result::Result<Option<Value>, Arc<JobFailure>> {
    match edge.future.await {
        Ok(value) => match edge.status {
            Status::Failure => Err(Arc::new(JobFailure::JobNotFailed { parent: edge.name })),
            _ => Ok(Some(value)),
        },
        Err(failure) => match edge.status {
            Status::Success => Err(failure),
            _ => Ok(None),
        },
    }
}

async fn run_job(spec: JobSpec, parents: Vec<ParentEdge>, workers: Arc<Semaphore>) -> JobResult {
    let name = spec.name.clone();
    let mut conditions: FuturesUnordered<_> = parents.into_iter().map(condition).collect();

    match spec.wait_mode {
        WaitMode::All => {
            while let Some(result) = conditions.next().await {
                if let Err(cause) = result {
                    debug!(job = name.as_str(), "aborting, dependency never satisfied");
                    return Err(Arc::new(JobFailure::DependencyNeverSatisfied {
                        job: name,
                        cause: Some(cause),
                    }));
                }
            }
        }
        WaitMode::Any => {
            if !conditions.is_empty() {
                let mut satisfied = false;
                let mut last = None;
                while let Some(result) = conditions.next().await {
                    match result {
                        Ok(_) => {
                            satisfied = true;
                            break;
                        }
                        Err(cause) => last = Some(cause),
                    }
                }
                if !satisfied {
                    debug!(job = name.as_str(), "aborting, dependency never satisfied");
                    return Err(Arc::new(JobFailure::DependencyNeverSatisfied {
                        job: name,
                        cause: last,
                    }));
                }
            }
        }
    }

    // Dropping the set cancels the conditions still pending after a
    // satisfied waitfor(any) gate.
    drop(conditions);

    debug!(job = name.as_str(), "executing body");
    match spec.array {
        None => run_element(spec.task, None, workers, name).await,
        Some(array) => {
            let elements = array.indices().into_iter().map(|i| {
                run_element(spec.task.clone(), Some(i), workers.clone(), name.clone())
            });
            let results = join_all(elements).await;

            let mut values = Vec::with_capacity(results.len());
            for result in results {
                match result {
                    Ok(value) => values.push(value),
                    Err(failure) => return Err(failure),
                }
            }
            Ok(Value::Array(values))
        }
    }
}

/// Run one body invocation on the blocking worker pool.
async fn run_element(
    task: Arc<Task>,
    index: Option<u32>,
    workers: Arc<Semaphore>,
    job: String,
) -> JobResult {
    let permit = match workers.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return Err(Arc::new(JobFailure::Failed {
                job,
                error: anyhow!("worker pool closed"),
            }))
        }
    };

    let joined = task::spawn_blocking(move || {
        let _permit = permit;
        task.call(index)
    })
    .await;

    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(Arc::new(error.into())),
        Err(panic) => Err(Arc::new(JobFailure::Failed {
            job,
            error: anyhow!("job body panicked: {panic}"),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{job, JobBody};
    use serde_json::json;

    fn done_future(result: JobResult) -> JobFuture {
        async move { result }.boxed().shared()
    }

    fn failure() -> Arc<JobFailure> {
        Arc::new(JobFailure::Failed {
            job: "parent".to_string(),
            error: anyhow!("boom"),
        })
    }

    #[test]
    fn test_condition_truth_table() {
        let cases: Vec<(JobResult, Status, bool)> = vec![
            (Ok(json!(1)), Status::Success, true),
            (Ok(json!(1)), Status::Any, true),
            (Ok(json!(1)), Status::Failure, false),
            (Err(failure()), Status::Failure, true),
            (Err(failure()), Status::Any, true),
            (Err(failure()), Status::Success, false),
        ];

        for (result, status, satisfied) in cases {
            let edge = ParentEdge {
                future: done_future(result),
                name: "parent".to_string(),
                status,
            };
            let outcome = tokio_test::block_on(condition(edge));
            assert_eq!(outcome.is_ok(), satisfied, "status {status:?}");
        }
    }

    #[test]
    fn test_failed_parent_value_passes_through_failure_edge() {
        let edge = ParentEdge {
            future: done_future(Err(failure())),
            name: "parent".to_string(),
            status: Status::Failure,
        };
        let outcome = tokio_test::block_on(condition(edge)).unwrap();
        assert_eq!(outcome, None);
    }

    #[tokio::test]
    async fn test_submit_is_memoized() {
        let mut workflow = Workflow::new();
        let a = workflow.add(job("a").body(|| Ok(json!(1)))).unwrap();

        let scheduler = LocalScheduler::new(LocalOptions::default());
        let first = scheduler.submit(&workflow, a);
        let second = scheduler.submit(&workflow, a);

        assert!(first.ptr_eq(&second));
        assert_eq!(first.await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_body_error_resolves_future() {
        let mut workflow = Workflow::new();
        let a = workflow
            .add(job("a").body(|| Err(anyhow!("broken"))))
            .unwrap();

        let scheduler = LocalScheduler::new(LocalOptions::default());
        let results = scheduler.gather(&workflow, &[a]).await;

        let error = results[0].as_ref().unwrap_err();
        assert!(matches!(**error, JobFailure::Failed { .. }));
    }

    #[test]
    fn test_task_error_mapping() {
        let mapped: JobFailure = TaskError::Arity {
            job: "a".to_string(),
        }
        .into();
        assert!(matches!(mapped, JobFailure::Failed { .. }));
    }

    #[test]
    fn test_job_body_debug_is_opaque() {
        let body = JobBody::Plain(Arc::new(|| Ok(json!(null))));
        assert_eq!(format!("{body:?}"), "JobBody::Plain");
    }
}
