//! Index domains for array jobs

use serde::{Deserialize, Serialize};

/// The index domain over which an array job is expanded.
///
/// A domain is either a half-open range with an explicit step, or an
/// arbitrary enumerated set of indices. Enumerated sets keep the order in
/// which the user provided the indices; ranges iterate in ascending order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArraySpec {
    /// Contiguous range `[start, stop)` with a step of at least 1.
    Range {
        /// First index of the range.
        start: u32,
        /// Exclusive upper bound of the range.
        stop: u32,
        /// Distance between consecutive indices.
        step: u32,
    },

    /// Arbitrary enumerated set of indices, in user-provided order.
    Set(Vec<u32>),
}

impl ArraySpec {
    /// Range `[0, count)` with step 1.
    pub fn count(count: u32) -> Self {
        ArraySpec::Range {
            start: 0,
            stop: count,
            step: 1,
        }
    }

    /// The indices of the domain, in iteration order.
    pub fn indices(&self) -> Vec<u32> {
        match self {
            ArraySpec::Range { start, stop, step } => {
                (*start..*stop).step_by((*step).max(1) as usize).collect()
            }
            ArraySpec::Set(indices) => indices.clone(),
        }
    }

    /// Number of indices in the domain.
    pub fn len(&self) -> usize {
        match self {
            ArraySpec::Range { .. } => self.indices().len(),
            ArraySpec::Set(indices) => indices.len(),
        }
    }

    /// Whether the domain contains no indices.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The value of the Slurm `--array` directive for this domain.
    ///
    /// Ranges render as `start-stop:step` with an inclusive stop, matching
    /// the scheduler's syntax; enumerated sets render as a comma-separated
    /// list.
    pub fn directive(&self) -> String {
        match self {
            ArraySpec::Range { start, stop, step } => {
                format!("{}-{}:{}", start, stop.saturating_sub(1), step)
            }
            ArraySpec::Set(indices) => indices
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

impl From<u32> for ArraySpec {
    fn from(count: u32) -> Self {
        ArraySpec::count(count)
    }
}

impl From<std::ops::Range<u32>> for ArraySpec {
    fn from(range: std::ops::Range<u32>) -> Self {
        ArraySpec::Range {
            start: range.start,
            stop: range.end,
            step: 1,
        }
    }
}

impl From<Vec<u32>> for ArraySpec {
    fn from(indices: Vec<u32>) -> Self {
        ArraySpec::Set(indices)
    }
}

impl FromIterator<u32> for ArraySpec {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        ArraySpec::Set(iter.into_iter().collect())
    }
}
