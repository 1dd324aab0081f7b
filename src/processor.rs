//! Subordinate processor
//!
//! The entry point invoked inside a cluster allocation. The generated
//! submission scripts call the pipeline program back with the path of a
//! payload file as the first argument and, for array jobs, the array
//! index as the second. A pipeline binary makes itself processable by
//! calling [`dispatch`] once its workflow is built (so the registry is
//! populated) and before it calls
//! [`schedule`](crate::scheduler::schedule).

use std::env;
use std::path::Path;
use std::process::ExitCode;

use serde_json::Value;
use tracing::debug;

use crate::registry::{self, TaskRef};
use crate::{Result, WorkflowError};

/// Load the task referenced by a payload file and run it, with the
/// array index iff one is given.
pub fn run(path: &Path, index: Option<u32>) -> Result<Value> {
    let reference = TaskRef::read(path)?;
    debug!(
        token = reference.token.as_str(),
        job = reference.job.as_str(),
        "processing payload"
    );

    let task = registry::resolve(&reference.token)
        .ok_or_else(|| WorkflowError::UnknownTask(reference.token.clone()))?;

    Ok(task.call(index)?)
}

/// Processor command-line entry: `processor <payload-path> [<index>]`.
///
/// Exits 0 when the task returns, non-zero on any failure.
pub fn main() -> ExitCode {
    let mut args = env::args().skip(1);

    let Some(path) = args.next() else {
        eprintln!("usage: processor <payload-path> [<array-index>]");
        return ExitCode::FAILURE;
    };

    let index = match args.next() {
        None => None,
        Some(raw) => match raw.parse::<u32>() {
            Ok(index) => Some(index),
            Err(_) => {
                eprintln!("invalid array index: {raw}");
                return ExitCode::FAILURE;
            }
        },
    };

    match run(Path::new(&path), index) {
        Ok(_) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}

/// If the current process was invoked as a subordinate processor, run
/// the referenced task and exit with its status; otherwise return so the
/// pipeline continues normally.
///
/// Invocation is recognized by the first argument naming a readable
/// payload file, which is how the generated submission scripts call the
/// pipeline program back.
pub fn dispatch() {
    if let Some(code) = try_dispatch() {
        std::process::exit(code);
    }
}

fn try_dispatch() -> Option<i32> {
    let args: Vec<String> = env::args().collect();
    let path = Path::new(args.get(1)?);
    if !path.is_file() || TaskRef::read(path).is_err() {
        return None;
    }

    let index = match args.get(2) {
        None => None,
        Some(raw) => match raw.parse::<u32>() {
            Ok(index) => Some(index),
            Err(_) => {
                eprintln!("invalid array index: {raw}");
                return Some(1);
            }
        },
    };

    match run(path, index) {
        Ok(_) => Some(0),
        Err(error) => {
            eprintln!("{error}");
            Some(1)
        }
    }
}
