//! Scheduling backends and the `schedule` entry point
//!
//! A workflow is executed by handing its entry jobs to [`schedule`]: the
//! graph is checked for cycles, pruned of already-done work, and then
//! driven either by the in-process [`LocalScheduler`] or emitted and
//! submitted to Slurm by the [`SlurmScheduler`].

use async_trait::async_trait;
use lazy_static::lazy_static;
use thiserror::Error;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::graph::{Direction, JobId, Workflow};
use crate::Result;

pub mod local;
pub mod slurm;

pub use local::{JobFailure, JobFuture, JobResult, LocalOptions, LocalScheduler};
pub use slurm::{RunMetadata, SlurmOptions, SlurmRun, SlurmScheduler};

/// Errors specific to scheduling.
#[derive(Error, Debug)]
pub enum ScheduleError {
    /// The dependency graph contains a cycle.
    #[error("cyclic dependency graph: {0}")]
    CyclicGraph(String),

    /// A required executable was not found on `PATH`.
    #[error("`{0}` executable not found")]
    MissingExecutable(String),

    /// The cluster submission command failed.
    #[error("submission of job `{job}` failed: {reason}")]
    SubmissionFailed {
        /// Name of the job whose submission failed.
        job: String,
        /// Stderr of the submission command, or a short description.
        reason: String,
    },

    /// Filesystem or process error while emitting a run.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Execution backends this build can reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process execution.
    Local,

    /// Submission to a Slurm cluster.
    Slurm,
}

lazy_static! {
    static ref BACKENDS: Vec<BackendKind> = {
        let mut backends = vec![BackendKind::Local];
        if slurm_detected() {
            backends.push(BackendKind::Slurm);
        }
        backends
    };
}

/// The backends available on this machine, detected once per process.
///
/// The local backend is always available; Slurm is appended when the
/// `sbatch` executable is discoverable on `PATH`.
pub fn available_backends() -> &'static [BackendKind] {
    &BACKENDS
}

pub(crate) fn slurm_detected() -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join("sbatch").is_file()))
        .unwrap_or(false)
}

/// Backend selection, with per-backend options.
#[derive(Debug)]
pub enum Backend {
    /// Run in-process on the local machine.
    Local(LocalOptions),

    /// Emit submission scripts and submit them to Slurm.
    Slurm(SlurmOptions),
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Local(LocalOptions::default())
    }
}

/// Options of a [`schedule`] invocation.
#[derive(Debug)]
pub struct ScheduleOptions {
    /// The backend to execute on.
    pub backend: Backend,

    /// Whether to prune already-done work first. Defaults to `true`.
    pub prune: bool,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            prune: true,
        }
    }
}

impl ScheduleOptions {
    /// Local execution with default options.
    pub fn local() -> Self {
        Self {
            backend: Backend::Local(LocalOptions::default()),
            prune: true,
        }
    }

    /// Slurm submission with the given options.
    pub fn slurm(options: SlurmOptions) -> Self {
        Self {
            backend: Backend::Slurm(options),
            prune: true,
        }
    }
}

/// What a schedule produced.
#[derive(Debug)]
pub enum ScheduleOutput {
    /// Per-entry-job results of a local run, in entry order. Entries
    /// whose postconditions already held are elided.
    Local(Vec<JobResult>),

    /// Description of a submitted Slurm run.
    Slurm(SlurmRun),
}

#[async_trait]
pub(crate) trait Executor {
    async fn execute(&self, workflow: Workflow, targets: Vec<JobId>) -> Result<ScheduleOutput>;
}

/// Execute the workflow up to the given entry jobs.
///
/// The graph is first checked for cycles backward from the entries; a
/// cycle fails the schedule before any body runs. Unless disabled, the
/// pruner then elides work whose postconditions already hold. The
/// remaining jobs are driven by the selected backend: the local backend
/// returns the entry jobs' results, the Slurm backend returns the
/// identifiers the cluster assigned to the submitted run.
pub async fn schedule(
    mut workflow: Workflow,
    targets: &[JobId],
    options: ScheduleOptions,
) -> Result<ScheduleOutput> {
    if let Some(cycle) = workflow.cycles(targets, Direction::Incoming).next() {
        let path = cycle
            .iter()
            .map(|&id| workflow.job(id).name().to_string())
            .collect::<Vec<_>>()
            .join(" <- ");
        return Err(ScheduleError::CyclicGraph(path).into());
    }

    let targets = if options.prune {
        workflow.prune(targets)
    } else {
        targets.to_vec()
    };

    let span = info_span!("schedule", run = %Uuid::new_v4(), jobs = targets.len());
    match options.backend {
        Backend::Local(options) => {
            LocalScheduler::new(options)
                .execute(workflow, targets)
                .instrument(span)
                .await
        }
        Backend::Slurm(options) => {
            SlurmScheduler::new(options)?
                .execute(workflow, targets)
                .instrument(span)
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_backend_is_always_available() {
        assert_eq!(available_backends()[0], BackendKind::Local);
    }

    #[test]
    fn test_default_options_prune() {
        let options = ScheduleOptions::local();
        assert!(options.prune);
        assert!(matches!(options.backend, Backend::Local(_)));
    }
}
