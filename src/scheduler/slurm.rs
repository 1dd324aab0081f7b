//! Slurm backend: submission-script emission and the submission driver
//!
//! Each schedule invocation materializes a run directory under the base
//! path containing one submission script and one callable-reference
//! payload per job, a `logs/` directory the scripts write into, run
//! metadata, and the list of scheduler-assigned job identifiers. Jobs
//! are submitted in topological order and chained with `--dependency`
//! flags, so the cluster itself enforces the edge gating.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::info;

use crate::graph::{ArraySpec, JobId, Status, WaitMode, Workflow};
use crate::registry::{self, TaskRef};
use crate::scheduler::{slurm_detected, Executor, ScheduleError, ScheduleOutput};
use crate::Result;

/// Options of the Slurm backend.
#[derive(Debug, Clone)]
pub struct SlurmOptions {
    /// Run name; defaults to a `%y%m%d_%H%M%S` timestamp.
    pub name: Option<String>,

    /// Base directory holding run directories. Defaults to
    /// `.workflows`.
    pub dir: PathBuf,

    /// Shebang shell of the generated scripts; defaults to `$SHELL`,
    /// falling back to `/bin/sh`.
    pub shell: Option<String>,

    /// Shell lines prepended to every script that does not carry its
    /// own environment preamble.
    pub env: Vec<String>,

    /// Scheduler-wide settings, overridden by per-job settings.
    pub settings: BTreeMap<String, Option<String>>,

    /// Program invoked inside the allocation to process a payload file;
    /// defaults to the current executable.
    pub program: Option<PathBuf>,

    /// The submission command. Overridable for testing.
    pub sbatch: PathBuf,
}

impl Default for SlurmOptions {
    fn default() -> Self {
        Self {
            name: None,
            dir: PathBuf::from(".workflows"),
            shell: None,
            env: Vec::new(),
            settings: BTreeMap::new(),
            program: None,
            sbatch: PathBuf::from("sbatch"),
        }
    }
}

/// Description of a submitted run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlurmRun {
    /// Name of the run.
    pub name: String,

    /// The run directory holding scripts, payloads and logs.
    pub dir: PathBuf,

    /// Scheduler-assigned job identifiers, in submission order.
    pub job_ids: Vec<String>,
}

/// Metadata recorded at the root of every run directory, consumed by
/// external administrative tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Name of the run.
    pub name: String,

    /// Submission time, unix seconds.
    pub datetime: i64,

    /// Arguments the pipeline program was invoked with.
    pub args: Vec<String>,

    /// Path of the pipeline program.
    pub pipeline: PathBuf,

    /// Engine version that produced the run.
    pub version: String,
}

#[derive(Debug, Serialize)]
struct PostconditionRecord {
    job: String,
    array: Option<ArraySpec>,
    conditions: Vec<String>,
}

/// Emits one submission script per job and drives `sbatch` over them in
/// topological order.
pub struct SlurmScheduler {
    name: String,
    dir: PathBuf,
    shell: String,
    env: Vec<String>,
    settings: BTreeMap<String, Option<String>>,
    program: PathBuf,
    sbatch: PathBuf,
}

fn translate(key: &str) -> &str {
    match key {
        "cpus" => "cpus-per-task",
        "gpus" => "gpus-per-task",
        "memory" => "mem",
        "timelimit" => "time",
        other => other,
    }
}

fn keyword(status: Status) -> &'static str {
    match status {
        Status::Success => "afterok",
        Status::Failure => "afternotok",
        Status::Any => "afterany",
    }
}

impl SlurmScheduler {
    /// Create a scheduler from options, resolving the run name, shell
    /// and processor program.
    pub fn new(options: SlurmOptions) -> Result<Self> {
        if options.sbatch == Path::new("sbatch") && !slurm_detected() {
            return Err(ScheduleError::MissingExecutable("sbatch".to_string()).into());
        }

        let name = options
            .name
            .unwrap_or_else(|| Local::now().format("%y%m%d_%H%M%S").to_string());
        let dir = options.dir.join(&name);

        let shell = options
            .shell
            .or_else(|| env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string());

        let program = match options.program {
            Some(program) => program,
            None => env::current_exe().map_err(ScheduleError::Io)?,
        };

        Ok(Self {
            name,
            dir,
            shell,
            env: options.env,
            settings: options.settings,
            program,
            sbatch: options.sbatch,
        })
    }

    /// Name of the run.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The run directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Per-run identifier of each job: its name when unique within the
    /// run, otherwise the name suffixed with the job's stable numeric
    /// identifier.
    fn identifiers(&self, workflow: &Workflow, order: &[JobId]) -> HashMap<JobId, String> {
        let mut occurrences: HashMap<&str, usize> = HashMap::new();
        for &id in order {
            *occurrences.entry(workflow.job(id).name()).or_insert(0) += 1;
        }

        order
            .iter()
            .map(|&id| {
                let name = workflow.job(id).name();
                let identifier = if occurrences[name] == 1 {
                    name.to_string()
                } else {
                    format!("{}_{}", name, id.index())
                };
                (id, identifier)
            })
            .collect()
    }

    /// Render the submission script of one job.
    ///
    /// `dependencies` pairs each parent's scheduler-assigned identifier
    /// with the status gate of its edge.
    fn render_script(
        &self,
        workflow: &Workflow,
        id: JobId,
        identifier: &str,
        dependencies: &[(String, Status)],
    ) -> String {
        let job = workflow.job(id);
        let mut lines = vec![
            format!("#!{}", self.shell),
            "#".to_string(),
            format!("#SBATCH --job-name={}", job.name()),
        ];

        if let Some(array) = job.array() {
            lines.push(format!("#SBATCH --array={}", array.directive()));
            lines.push(format!(
                "#SBATCH --output={}",
                self.dir
                    .join("logs")
                    .join(format!("{identifier}_%j_%a.log"))
                    .display()
            ));
        } else {
            lines.push(format!(
                "#SBATCH --output={}",
                self.dir
                    .join("logs")
                    .join(format!("{identifier}_%j.log"))
                    .display()
            ));
        }
        lines.push("#".to_string());

        let mut settings = self.settings.clone();
        settings.extend(job.settings().clone());

        let conda = settings
            .remove("conda")
            .flatten()
            .or_else(|| env::var("CONDA_DEFAULT_ENV").ok());

        if !settings.is_empty() {
            for (key, value) in &settings {
                match value {
                    Some(value) => {
                        lines.push(format!("#SBATCH --{}={}", translate(key), value))
                    }
                    None => lines.push(format!("#SBATCH --{}", translate(key))),
                }
            }
            lines.push("#".to_string());
        }

        if !dependencies.is_empty() {
            let separator = match job.wait_mode() {
                WaitMode::Any => "?",
                WaitMode::All => ",",
            };
            let tokens = dependencies
                .iter()
                .map(|(jobid, status)| format!("{}:{}", keyword(*status), jobid))
                .collect::<Vec<_>>()
                .join(separator);
            lines.push(format!("#SBATCH --dependency={tokens}"));
            lines.push("#".to_string());
        }

        lines.extend([
            "#SBATCH --export=ALL".to_string(),
            "#SBATCH --parsable".to_string(),
            "#SBATCH --requeue".to_string(),
            String::new(),
        ]);

        let mut env_lines = Vec::new();
        if let Some(environment) = conda {
            env_lines.push(r#"eval "$(conda shell.bash hook)""#.to_string());
            env_lines.push(format!("conda activate {environment}"));
        }
        if !job.env().is_empty() {
            env_lines.extend(job.env().iter().cloned());
        } else {
            env_lines.extend(self.env.iter().cloned());
        }
        if !env_lines.is_empty() {
            lines.extend(env_lines);
            lines.push(String::new());
        }

        let payload = self.dir.join(format!("{identifier}.pkl"));
        let mut invocation = format!("{} {}", self.program.display(), payload.display());
        if job.is_array() {
            invocation.push_str(" $SLURM_ARRAY_TASK_ID");
        }
        lines.push(invocation);
        lines.push(String::new());

        lines.join("\n")
    }

    fn write_metadata(&self) -> Result<()> {
        let metadata = RunMetadata {
            name: self.name.clone(),
            datetime: Utc::now().timestamp(),
            args: env::args().collect(),
            pipeline: self.program.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let rendered = serde_json::to_string_pretty(&metadata)?;
        fs::write(self.dir.join("metadata.json"), rendered).map_err(ScheduleError::Io)?;
        Ok(())
    }

    fn write_postconditions(&self, workflow: &Workflow, order: &[JobId]) -> Result<()> {
        let records: Vec<PostconditionRecord> = order
            .iter()
            .map(|&id| workflow.job(id))
            .filter(|job| !job.postconditions().is_empty())
            .map(|job| PostconditionRecord {
                job: job.name().to_string(),
                array: job.array().cloned(),
                conditions: job
                    .postconditions()
                    .iter()
                    .map(|condition| condition.label().to_string())
                    .collect(),
            })
            .collect();
        let rendered = serde_json::to_string_pretty(&records)?;
        fs::write(self.dir.join("postconditions"), rendered).map_err(ScheduleError::Io)?;
        Ok(())
    }

    fn write_identifiers(&self, job_ids: &[String]) -> Result<()> {
        let mut rendered = job_ids.join("\n");
        rendered.push('\n');
        fs::write(self.dir.join("job_identifiers"), rendered).map_err(ScheduleError::Io)?;
        Ok(())
    }

    /// Submit one script and return the scheduler-assigned identifier:
    /// the first non-empty token on the submission command's stdout.
    async fn submit_script(&self, job: &str, script: &Path) -> Result<String> {
        let output = Command::new(&self.sbatch)
            .arg(script)
            .output()
            .await
            .map_err(ScheduleError::Io)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let reason = if stderr.is_empty() {
                format!("exit status {}", output.status)
            } else {
                stderr
            };
            return Err(ScheduleError::SubmissionFailed {
                job: job.to_string(),
                reason,
            }
            .into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        match stdout.split_whitespace().next() {
            Some(jobid) => Ok(jobid.to_string()),
            None => Err(ScheduleError::SubmissionFailed {
                job: job.to_string(),
                reason: "no job identifier on stdout".to_string(),
            }
            .into()),
        }
    }
}

#[async_trait]
impl Executor for SlurmScheduler {
    async fn execute(&self, workflow: Workflow, targets: Vec<JobId>) -> Result<ScheduleOutput> {
        fs::create_dir_all(self.dir.join("logs")).map_err(ScheduleError::Io)?;

        let order = workflow.topological(&targets);
        let identifiers = self.identifiers(&workflow, &order);

        self.write_metadata()?;
        self.write_postconditions(&workflow, &order)?;

        let mut assigned: HashMap<JobId, String> = HashMap::new();
        let mut job_ids = Vec::with_capacity(order.len());

        for &id in &order {
            let job = workflow.job(id);
            let identifier = identifiers[&id].clone();

            registry::register(identifier.clone(), job.task());
            let payload = self.dir.join(format!("{identifier}.pkl"));
            TaskRef {
                token: identifier.clone(),
                job: job.name().to_string(),
            }
            .write(&payload)?;

            let dependencies: Vec<(String, Status)> = workflow
                .parents(id)
                .into_iter()
                .filter_map(|(parent, status)| {
                    assigned.get(&parent).map(|jobid| (jobid.clone(), status))
                })
                .collect();

            let script = self.render_script(&workflow, id, &identifier, &dependencies);
            let script_path = self.dir.join(format!("{identifier}.sh"));
            fs::write(&script_path, script).map_err(ScheduleError::Io)?;

            let jobid = match self.submit_script(job.name(), &script_path).await {
                Ok(jobid) => jobid,
                Err(error) => {
                    // Keep the generated files and the identifiers
                    // assigned so far for diagnosis.
                    self.write_identifiers(&job_ids)?;
                    return Err(error);
                }
            };

            info!(job = job.name(), id = jobid.as_str(), "submitted");
            assigned.insert(id, jobid.clone());
            job_ids.push(jobid);
        }

        self.write_identifiers(&job_ids)?;

        Ok(ScheduleOutput::Slurm(SlurmRun {
            name: self.name.clone(),
            dir: self.dir.clone(),
            job_ids,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{job, WaitMode};
    use serde_json::json;

    fn scheduler() -> SlurmScheduler {
        SlurmScheduler {
            name: "test".to_string(),
            dir: PathBuf::from("/tmp/workflows/test"),
            shell: "/bin/bash".to_string(),
            env: Vec::new(),
            settings: BTreeMap::new(),
            program: PathBuf::from("/opt/pipeline"),
            sbatch: PathBuf::from("sbatch"),
        }
    }

    #[test]
    fn test_translate_table() {
        assert_eq!(translate("cpus"), "cpus-per-task");
        assert_eq!(translate("gpus"), "gpus-per-task");
        assert_eq!(translate("memory"), "mem");
        assert_eq!(translate("timelimit"), "time");
        assert_eq!(translate("partition"), "partition");
        assert_eq!(translate("exclusive"), "exclusive");
    }

    #[test]
    fn test_render_plain_job() {
        let mut workflow = Workflow::new();
        let a = workflow
            .add(job("a").cpus(4).memory("4GB").body(|| Ok(json!(null))))
            .unwrap();

        let script = scheduler().render_script(&workflow, a, "a", &[]);

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --job-name=a"));
        assert!(script.contains("#SBATCH --cpus-per-task=4"));
        assert!(script.contains("#SBATCH --mem=4GB"));
        assert!(script.contains("#SBATCH --output=/tmp/workflows/test/logs/a_%j.log"));
        assert!(script.contains("#SBATCH --export=ALL"));
        assert!(script.contains("#SBATCH --parsable"));
        assert!(script.contains("#SBATCH --requeue"));
        assert!(script.contains("/opt/pipeline /tmp/workflows/test/a.pkl"));
        assert!(!script.contains("--array"));
        assert!(!script.contains("$SLURM_ARRAY_TASK_ID"));
    }

    #[test]
    fn test_render_array_job() {
        let mut workflow = Workflow::new();
        let a = workflow
            .add(job("a").array(0..3).body_indexed(|i| Ok(json!(i))))
            .unwrap();

        let script = scheduler().render_script(&workflow, a, "a", &[]);

        assert!(script.contains("#SBATCH --array=0-2:1"));
        assert!(script.contains("#SBATCH --output=/tmp/workflows/test/logs/a_%j_%a.log"));
        assert!(script.contains("/opt/pipeline /tmp/workflows/test/a.pkl $SLURM_ARRAY_TASK_ID"));
    }

    #[test]
    fn test_render_dependencies() {
        let mut workflow = Workflow::new();
        let a = workflow.add(job("a").body(|| Ok(json!(null)))).unwrap();
        let b = workflow.add(job("b").body(|| Ok(json!(null)))).unwrap();
        let c = workflow
            .add(
                job("c")
                    .body(|| Ok(json!(null)))
                    .after(a)
                    .after_status(b, Status::Failure),
            )
            .unwrap();

        let dependencies = vec![
            ("100".to_string(), Status::Success),
            ("101".to_string(), Status::Failure),
        ];
        let script = scheduler().render_script(&workflow, c, "c", &dependencies);
        assert!(script.contains("#SBATCH --dependency=afterok:100,afternotok:101"));

        let d = workflow
            .add(
                job("d")
                    .body(|| Ok(json!(null)))
                    .waitfor(WaitMode::Any)
                    .after(a)
                    .after_status(b, Status::Any),
            )
            .unwrap();
        let dependencies = vec![
            ("100".to_string(), Status::Success),
            ("101".to_string(), Status::Any),
        ];
        let script = scheduler().render_script(&workflow, d, "d", &dependencies);
        assert!(script.contains("#SBATCH --dependency=afterok:100?afterany:101"));
    }

    #[test]
    fn test_render_flag_only_directive() {
        let mut workflow = Workflow::new();
        let a = workflow
            .add(job("a").flag("exclusive").body(|| Ok(json!(null))))
            .unwrap();

        let script = scheduler().render_script(&workflow, a, "a", &[]);
        assert!(script.contains("#SBATCH --exclusive\n"));
    }

    #[test]
    fn test_render_conda_activation() {
        let mut workflow = Workflow::new();
        let a = workflow
            .add(job("a").conda("science").body(|| Ok(json!(null))))
            .unwrap();

        let script = scheduler().render_script(&workflow, a, "a", &[]);
        assert!(script.contains(r#"eval "$(conda shell.bash hook)""#));
        assert!(script.contains("conda activate science"));
        assert!(!script.contains("--conda"));
    }

    #[test]
    fn test_job_env_overrides_scheduler_env() {
        let mut workflow = Workflow::new();
        let a = workflow
            .add(
                job("a")
                    .env(["module load cuda"])
                    .body(|| Ok(json!(null))),
            )
            .unwrap();
        let b = workflow.add(job("b").body(|| Ok(json!(null)))).unwrap();

        let mut slurm = scheduler();
        slurm.env = vec!["source .venv/bin/activate".to_string()];

        let script = slurm.render_script(&workflow, a, "a", &[]);
        assert!(script.contains("module load cuda"));
        assert!(!script.contains("source .venv/bin/activate"));

        let script = slurm.render_script(&workflow, b, "b", &[]);
        assert!(script.contains("source .venv/bin/activate"));
    }

    #[test]
    fn test_identifiers_disambiguate_duplicates() {
        let mut workflow = Workflow::new();
        let a = workflow.add(job("fit").body(|| Ok(json!(null)))).unwrap();
        let b = workflow.add(job("fit").body(|| Ok(json!(null)))).unwrap();
        let c = workflow.add(job("merge").body(|| Ok(json!(null)))).unwrap();

        let identifiers = scheduler().identifiers(&workflow, &[a, b, c]);
        assert_eq!(identifiers[&c], "merge");
        assert_ne!(identifiers[&a], identifiers[&b]);
        assert!(identifiers[&a].starts_with("fit_"));
    }
}
