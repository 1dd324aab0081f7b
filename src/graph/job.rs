//! Job definitions and the builder surface used to annotate them

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::{ArraySpec, Condition};
use crate::registry::Task;

/// Status gate attached to a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The dependency must complete without failing.
    Success,

    /// The dependency must fail.
    Failure,

    /// The dependency must complete, with any outcome.
    Any,
}

/// Policy for combining the outcomes of a job's dependency edges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitMode {
    /// Every dependency edge must be satisfied.
    #[default]
    All,

    /// A single satisfied dependency edge is enough.
    Any,
}

/// The executable payload of a job.
///
/// Bodies are zero-argument for plain jobs and take the array index for
/// array jobs. Both return a JSON value so results can flow to the caller
/// of `schedule`.
#[derive(Clone)]
pub enum JobBody {
    /// Zero-argument body.
    Plain(Arc<dyn Fn() -> anyhow::Result<Value> + Send + Sync>),

    /// Body invoked once per array index.
    Indexed(Arc<dyn Fn(u32) -> anyhow::Result<Value> + Send + Sync>),
}

impl JobBody {
    /// Whether the body takes an array index.
    pub fn is_indexed(&self) -> bool {
        matches!(self, JobBody::Indexed(_))
    }
}

impl fmt::Debug for JobBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobBody::Plain(_) => f.write_str("JobBody::Plain"),
            JobBody::Indexed(_) => f.write_str("JobBody::Indexed"),
        }
    }
}

/// A unit of work in a workflow graph.
///
/// Jobs carry their body, an optional array domain, resource settings for
/// the cluster backend, environment preamble lines, pre- and
/// postconditions, a wait mode and a disabled marker. Dependency edges
/// live in the owning [`Workflow`](crate::graph::Workflow).
#[derive(Debug, Clone)]
pub struct Job {
    name: String,
    body: JobBody,
    array: Option<ArraySpec>,
    settings: BTreeMap<String, Option<String>>,
    env: Vec<String>,
    preconditions: Vec<Condition>,
    postconditions: Vec<Condition>,
    wait_mode: WaitMode,
    disabled: bool,
}

impl Job {
    /// Human-readable name of the job.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The body of the job.
    pub fn body(&self) -> &JobBody {
        &self.body
    }

    /// The array domain, if this is an array job.
    pub fn array(&self) -> Option<&ArraySpec> {
        self.array.as_ref()
    }

    /// Whether this is an array job.
    pub fn is_array(&self) -> bool {
        self.array.is_some()
    }

    pub(crate) fn set_array(&mut self, array: ArraySpec) {
        self.array = Some(array);
    }

    /// Resource settings forwarded to the cluster backend.
    pub fn settings(&self) -> &BTreeMap<String, Option<String>> {
        &self.settings
    }

    /// Mutable access to the resource settings.
    pub fn settings_mut(&mut self) -> &mut BTreeMap<String, Option<String>> {
        &mut self.settings
    }

    /// Shell lines prepended to this job's cluster script.
    pub fn env(&self) -> &[String] {
        &self.env
    }

    /// Preconditions checked before the body runs.
    pub fn preconditions(&self) -> &[Condition] {
        &self.preconditions
    }

    /// Postconditions checked after the body runs.
    pub fn postconditions(&self) -> &[Condition] {
        &self.postconditions
    }

    /// How dependency-edge outcomes are combined.
    pub fn wait_mode(&self) -> WaitMode {
        self.wait_mode
    }

    /// Whether the job is elided from the graph at schedule time.
    pub fn disabled(&self) -> bool {
        self.disabled
    }

    /// Mark the job disabled or enabled.
    pub fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
    }

    /// Whether the job's postconditions certify it as already complete.
    ///
    /// A job with no postconditions is never done. An array job is done
    /// when every postcondition holds for every index of the current
    /// array; indexed postconditions of non-array jobs never arise (the
    /// arity is rejected at build time).
    pub fn is_done(&self) -> bool {
        if self.postconditions.is_empty() {
            return false;
        }

        match &self.array {
            None => self
                .postconditions
                .iter()
                .filter(|condition| !condition.is_indexed())
                .all(|condition| condition.eval(None)),
            Some(array) => {
                let indices = array.indices();
                self.postconditions.iter().all(|condition| {
                    if condition.is_indexed() {
                        indices.iter().all(|&i| condition.eval(Some(i)))
                    } else {
                        condition.eval(None)
                    }
                })
            }
        }
    }

    /// Whether the postconditions hold for a single array index.
    pub fn is_done_at(&self, index: u32) -> bool {
        !self.postconditions.is_empty()
            && self
                .postconditions
                .iter()
                .all(|condition| condition.eval(Some(index)))
    }

    /// Snapshot of the executable parts of the job, shared between the
    /// local scheduler and the task registry.
    pub fn task(&self) -> Task {
        Task::new(
            self.name.clone(),
            self.body.clone(),
            self.preconditions.clone(),
            self.postconditions.clone(),
        )
    }
}

/// Start annotating a new job with the given name.
///
/// This is the crate's decorator surface: the builder accumulates the
/// body, dependencies and annotations, and
/// [`Workflow::add`](crate::graph::Workflow::add) validates and finalizes
/// the job.
pub fn job(name: impl Into<String>) -> JobBuilder {
    JobBuilder::new(name)
}

/// Accumulates annotations for a job before it joins a workflow.
#[derive(Debug)]
pub struct JobBuilder {
    pub(crate) name: String,
    pub(crate) body: Option<JobBody>,
    pub(crate) array: Option<ArraySpec>,
    pub(crate) settings: BTreeMap<String, Option<String>>,
    pub(crate) env: Vec<String>,
    pub(crate) preconditions: Vec<Condition>,
    pub(crate) postconditions: Vec<Condition>,
    pub(crate) wait_mode: WaitMode,
    pub(crate) disabled: bool,
    pub(crate) dependencies: Vec<(super::JobId, Status)>,
}

impl JobBuilder {
    /// Create a builder for a job with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: None,
            array: None,
            settings: BTreeMap::new(),
            env: Vec::new(),
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            wait_mode: WaitMode::All,
            disabled: false,
            dependencies: Vec::new(),
        }
    }

    /// Override the job name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set a zero-argument body.
    pub fn body<F>(mut self, body: F) -> Self
    where
        F: Fn() -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.body = Some(JobBody::Plain(Arc::new(body)));
        self
    }

    /// Set a body invoked once per array index.
    pub fn body_indexed<F>(mut self, body: F) -> Self
    where
        F: Fn(u32) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.body = Some(JobBody::Indexed(Arc::new(body)));
        self
    }

    /// Expand the job over an index domain.
    pub fn array(mut self, array: impl Into<ArraySpec>) -> Self {
        self.array = Some(array.into());
        self
    }

    /// Expand the job over `0..n`; alias of [`array`](Self::array).
    pub fn tasks(self, n: u32) -> Self {
        self.array(n)
    }

    /// Depend on another job completing successfully.
    pub fn after(self, dependency: super::JobId) -> Self {
        self.after_status(dependency, Status::Success)
    }

    /// Depend on another job with an explicit status gate.
    pub fn after_status(mut self, dependency: super::JobId, status: Status) -> Self {
        self.dependencies.push((dependency, status));
        self
    }

    /// Set how dependency-edge outcomes are combined.
    pub fn waitfor(mut self, mode: WaitMode) -> Self {
        self.wait_mode = mode;
        self
    }

    /// Add a zero-argument postcondition.
    pub fn ensure<F>(mut self, condition: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.postconditions.push(Condition::new(condition));
        self
    }

    /// Add a postcondition evaluated per array index.
    pub fn ensure_each<F>(mut self, condition: F) -> Self
    where
        F: Fn(u32) -> bool + Send + Sync + 'static,
    {
        self.postconditions.push(Condition::indexed(condition));
        self
    }

    /// Add a zero-argument precondition.
    pub fn ensure_before<F>(mut self, condition: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.preconditions.push(Condition::new(condition));
        self
    }

    /// Add a precondition evaluated per array index.
    pub fn ensure_before_each<F>(mut self, condition: F) -> Self
    where
        F: Fn(u32) -> bool + Send + Sync + 'static,
    {
        self.preconditions.push(Condition::indexed(condition));
        self
    }

    /// Add an already-constructed postcondition, keeping its label.
    pub fn ensure_condition(mut self, condition: Condition) -> Self {
        self.postconditions.push(condition);
        self
    }

    /// Elide the job from the graph at schedule time.
    pub fn disable(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Requested CPU cores.
    pub fn cpus(self, n: u32) -> Self {
        self.set("cpus", n.to_string())
    }

    /// Requested GPUs.
    pub fn gpus(self, n: u32) -> Self {
        self.set("gpus", n.to_string())
    }

    /// Requested memory, as a size with unit (for example `"4GB"`).
    pub fn memory(self, memory: impl Into<String>) -> Self {
        self.set("memory", memory)
    }

    /// Wall-clock limit, `D-HH:MM:SS` or `HH:MM:SS`.
    pub fn timelimit(self, timelimit: impl Into<String>) -> Self {
        self.set("timelimit", timelimit)
    }

    /// Target cluster partition.
    pub fn partition(self, partition: impl Into<String>) -> Self {
        self.set("partition", partition)
    }

    /// Target cluster partitions, in preference order.
    pub fn partitions<I, S>(self, partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let joined = partitions
            .into_iter()
            .map(Into::into)
            .collect::<Vec<_>>()
            .join(",");
        self.set("partition", joined)
    }

    /// Working directory of the job; must be an absolute path.
    pub fn chdir(self, dir: impl Into<String>) -> Self {
        self.set("chdir", dir)
    }

    /// Conda environment activated before the job body runs on the
    /// cluster.
    pub fn conda(self, environment: impl Into<String>) -> Self {
        self.set("conda", environment)
    }

    /// Shell lines prepended to the job's cluster script.
    pub fn env<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env.extend(lines.into_iter().map(Into::into));
        self
    }

    /// Set an arbitrary scheduler directive, passed through verbatim.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), Some(value.into()));
        self
    }

    /// Set a value-less scheduler directive, passed through verbatim.
    pub fn flag(mut self, key: impl Into<String>) -> Self {
        self.settings.insert(key.into(), None);
        self
    }

    pub(crate) fn finalize(self) -> Job {
        Job {
            name: self.name,
            // Workflow::add validates presence before finalize runs.
            body: self
                .body
                .unwrap_or_else(|| JobBody::Plain(Arc::new(|| Ok(Value::Null)))),
            array: self.array,
            settings: self.settings,
            env: self.env,
            preconditions: self.preconditions,
            postconditions: self.postconditions,
            wait_mode: self.wait_mode,
            disabled: self.disabled,
        }
    }
}
