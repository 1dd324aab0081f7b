//! Pre- and postcondition predicates attached to jobs

use std::fmt;
use std::sync::Arc;

/// Boolean predicate evaluated before or after a job body.
///
/// A condition is either zero-argument or takes the array index of the
/// element being checked. Indexed conditions may only be attached to array
/// jobs; the arity is validated when the job is added to a workflow.
#[derive(Clone)]
pub struct Condition {
    label: Option<String>,
    check: Check,
}

#[derive(Clone)]
enum Check {
    Plain(Arc<dyn Fn() -> bool + Send + Sync>),
    Indexed(Arc<dyn Fn(u32) -> bool + Send + Sync>),
}

impl Condition {
    /// Zero-argument condition.
    pub fn new<F>(check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            label: None,
            check: Check::Plain(Arc::new(check)),
        }
    }

    /// Condition evaluated per array index.
    pub fn indexed<F>(check: F) -> Self
    where
        F: Fn(u32) -> bool + Send + Sync + 'static,
    {
        Self {
            label: None,
            check: Check::Indexed(Arc::new(check)),
        }
    }

    /// Attach a human-readable label, used when the condition is recorded
    /// in a run directory for external inspection.
    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Whether the condition takes an array index.
    pub fn is_indexed(&self) -> bool {
        matches!(self.check, Check::Indexed(_))
    }

    /// The label of the condition, if any.
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or("<condition>")
    }

    /// Evaluate the condition, passing the array index to indexed checks.
    pub fn eval(&self, index: Option<u32>) -> bool {
        match &self.check {
            Check::Plain(check) => check(),
            Check::Indexed(check) => index.map(|i| check(i)).unwrap_or(true),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("label", &self.label)
            .field("indexed", &self.is_indexed())
            .finish()
    }
}
