#![cfg(unix)]

use awflow::scheduler::{RunMetadata, ScheduleError};
use awflow::{
    job, schedule, Condition, ScheduleOptions, ScheduleOutput, SlurmOptions, Workflow,
    WorkflowError,
};
use serde_json::json;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Stand-in for `sbatch`: prints an incrementing job identifier the way
/// `--parsable` submissions do.
fn stub_sbatch(dir: &Path) -> PathBuf {
    let path = dir.join("sbatch");
    fs::write(
        &path,
        concat!(
            "#!/bin/sh\n",
            "count_file=\"$(dirname \"$0\")/count\"\n",
            "c=$(cat \"$count_file\" 2>/dev/null || echo 1000)\n",
            "echo \"$c\"\n",
            "echo $((c + 1)) > \"$count_file\"\n",
        ),
    )
    .unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Stand-in for a submission command that rejects every script.
fn failing_sbatch(dir: &Path) -> PathBuf {
    let path = dir.join("sbatch");
    fs::write(&path, "#!/bin/sh\necho 'invalid partition' >&2\nexit 1\n").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn options(base: &Path, sbatch: PathBuf) -> SlurmOptions {
    SlurmOptions {
        name: Some("run".to_string()),
        dir: base.to_path_buf(),
        shell: Some("/bin/bash".to_string()),
        program: Some(PathBuf::from("/opt/pipeline")),
        sbatch,
        ..SlurmOptions::default()
    }
}

/// Two chained jobs, the second an array: the generated script carries
/// the array directive, the dependency on the first job's returned
/// identifier, and the array-index variable in the invocation.
#[tokio::test]
async fn test_emitted_run_chains_dependencies() {
    let tmp = tempfile::tempdir().unwrap();
    let sbatch = stub_sbatch(tmp.path());

    let mut workflow = Workflow::new();
    let a = workflow
        .add(job("chain_a").cpus(2).body(|| Ok(json!(null))))
        .unwrap();
    let b = workflow
        .add(
            job("chain_b")
                .array(0..3)
                .body_indexed(|i| Ok(json!(i)))
                .after(a),
        )
        .unwrap();

    let output = schedule(
        workflow,
        &[b],
        ScheduleOptions::slurm(options(tmp.path(), sbatch)),
    )
    .await
    .unwrap();

    let run = match output {
        ScheduleOutput::Slurm(run) => run,
        other => panic!("expected a slurm run, got {other:?}"),
    };

    assert_eq!(run.name, "run");
    assert_eq!(run.job_ids, vec!["1000".to_string(), "1001".to_string()]);

    let script_a = fs::read_to_string(run.dir.join("chain_a.sh")).unwrap();
    assert!(script_a.starts_with("#!/bin/bash\n"));
    assert!(script_a.contains("#SBATCH --job-name=chain_a"));
    assert!(script_a.contains("#SBATCH --cpus-per-task=2"));
    assert!(!script_a.contains("--dependency"));

    let script_b = fs::read_to_string(run.dir.join("chain_b.sh")).unwrap();
    assert!(script_b.contains("#SBATCH --array=0-2:1"));
    assert!(script_b.contains("#SBATCH --dependency=afterok:1000"));
    assert!(script_b.contains("#SBATCH --parsable"));
    assert!(script_b.contains("$SLURM_ARRAY_TASK_ID"));

    assert!(run.dir.join("chain_a.pkl").is_file());
    assert!(run.dir.join("chain_b.pkl").is_file());
    assert!(run.dir.join("logs").is_dir());

    let identifiers = fs::read_to_string(run.dir.join("job_identifiers")).unwrap();
    assert_eq!(identifiers, "1000\n1001\n");
}

#[tokio::test]
async fn test_enumerated_array_directive() {
    let tmp = tempfile::tempdir().unwrap();
    let sbatch = stub_sbatch(tmp.path());

    let mut workflow = Workflow::new();
    let picks = workflow
        .add(
            job("picks")
                .array(vec![1, 4, 9])
                .body_indexed(|i| Ok(json!(i))),
        )
        .unwrap();

    let output = schedule(
        workflow,
        &[picks],
        ScheduleOptions::slurm(options(tmp.path(), sbatch)),
    )
    .await
    .unwrap();

    let run = match output {
        ScheduleOutput::Slurm(run) => run,
        other => panic!("expected a slurm run, got {other:?}"),
    };
    let script = fs::read_to_string(run.dir.join("picks.sh")).unwrap();
    assert!(script.contains("#SBATCH --array=1,4,9"));
}

#[tokio::test]
async fn test_run_metadata_is_recorded() {
    let tmp = tempfile::tempdir().unwrap();
    let sbatch = stub_sbatch(tmp.path());

    let mut workflow = Workflow::new();
    let solo = workflow
        .add(
            job("solo")
                .ensure_condition(Condition::new(|| false).labeled("output exists"))
                .body(|| Ok(json!(null))),
        )
        .unwrap();

    schedule(
        workflow,
        &[solo],
        ScheduleOptions::slurm(options(tmp.path(), sbatch)),
    )
    .await
    .unwrap();

    let run_dir = tmp.path().join("run");
    let raw = fs::read_to_string(run_dir.join("metadata.json")).unwrap();
    let metadata: RunMetadata = serde_json::from_str(&raw).unwrap();

    assert_eq!(metadata.name, "run");
    assert!(metadata.datetime > 0);
    assert_eq!(metadata.pipeline, PathBuf::from("/opt/pipeline"));
    assert_eq!(metadata.version, env!("CARGO_PKG_VERSION"));

    let postconditions = fs::read_to_string(run_dir.join("postconditions")).unwrap();
    let records: serde_json::Value = serde_json::from_str(&postconditions).unwrap();
    assert_eq!(records[0]["job"], json!("solo"));
    assert_eq!(records[0]["conditions"], json!(["output exists"]));
}

#[tokio::test]
async fn test_failed_submission_keeps_generated_files() {
    let tmp = tempfile::tempdir().unwrap();
    let sbatch = failing_sbatch(tmp.path());

    let mut workflow = Workflow::new();
    let doomed = workflow
        .add(job("doomed").body(|| Ok(json!(null))))
        .unwrap();

    let error = schedule(
        workflow,
        &[doomed],
        ScheduleOptions::slurm(options(tmp.path(), sbatch)),
    )
    .await
    .unwrap_err();

    match error {
        WorkflowError::Schedule(ScheduleError::SubmissionFailed { job, reason }) => {
            assert_eq!(job, "doomed");
            assert!(reason.contains("invalid partition"));
        }
        other => panic!("expected a submission failure, got {other}"),
    }

    let run_dir = tmp.path().join("run");
    assert!(run_dir.join("doomed.sh").is_file());
    assert!(run_dir.join("doomed.pkl").is_file());
    assert!(run_dir.join("metadata.json").is_file());
}
