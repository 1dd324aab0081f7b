//! # Awflow Rust Implementation
//!
//! A Rust implementation of acyclic workflows: declare directed acyclic
//! dependency graphs of jobs and execute them on the local machine or,
//! without writing a single submission script yourself, on a Slurm
//! cluster.
//!
//! ## Overview
//!
//! Jobs are annotated callables: resource requests, array expansion,
//! pre- and postconditions and dependency edges with per-edge status
//! gating (`success`, `failure`, `any`). The engine prunes work whose
//! postconditions already hold, then either drives the graph to
//! completion in-process with a cooperative async scheduler or emits one
//! submission script per job and chains them through the cluster's
//! dependency flags.
//!
//! ## Key Features
//!
//! - **Graph-based workflows**: dependency edges with status gating and
//!   per-job wait modes
//! - **Array jobs**: expand one callable over an index domain, locally
//!   or as a Slurm job array
//! - **Pruning**: postcondition-driven elision and array narrowing make
//!   re-runs resume where they left off
//! - **Async execution**: fully async/await compatible with the Tokio
//!   runtime
//! - **Slurm emission**: reproducible run directories with scripts,
//!   payloads, logs and metadata

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for workflow operations
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Main error type for workflow operations
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Graph construction error (arity, self-loops, unknown handles)
    #[error("Graph error: {0}")]
    Graph(#[from] graph::GraphError),

    /// Scheduling error (cycles, missing executables, failed submission)
    #[error("Schedule error: {0}")]
    Schedule(#[from] scheduler::ScheduleError),

    /// Task execution error surfaced by the subordinate processor
    #[error("Task error: {0}")]
    Task(#[from] registry::TaskError),

    /// A payload referenced a task this process never registered
    #[error("task `{0}` is not registered")]
    UnknownTask(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Payload encoding/decoding error
    #[error("Payload error: {0}")]
    Payload(#[from] bincode::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Core graph module containing jobs, traversals and the pruner
pub mod graph;

/// Subordinate processor invoked inside cluster allocations
pub mod processor;

/// Process-global task registry backing the cluster backend
pub mod registry;

/// Scheduling backends and the `schedule` entry point
pub mod scheduler;

pub use graph::{
    job, ArraySpec, Condition, Direction, Job, JobBuilder, JobId, Status, WaitMode, Workflow,
};
pub use scheduler::{
    available_backends, schedule, Backend, BackendKind, JobFailure, JobResult, LocalOptions,
    ScheduleOptions, ScheduleOutput, SlurmOptions, SlurmRun,
};
