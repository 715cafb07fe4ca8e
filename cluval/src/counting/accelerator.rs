use crate::error::Result;

use super::{CountJob, Tally};

/// Log markers that signal an exhausted accelerator.
pub const DEFAULT_EXHAUSTION_MARKERS: &[&str] = &[
    "out of memory",
    "CL_OUT_OF_RESOURCES",
    "CL_MEM_OBJECT_ALLOCATION_FAILURE",
    "CUDA_ERROR_OUT_OF_MEMORY",
];

/// Resource-constrained counting routine.
///
/// Implementations run on the accelerator worker thread, one job at a time.
pub trait Accelerator: Send {
    fn name(&self) -> &str;

    /// Counts `job`. Resource exhaustion is reported through the log text of
    /// the output, not through the error channel.
    fn count(&mut self, job: &CountJob) -> Result<AcceleratorOutput>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcceleratorOutput {
    /// `None` when the routine produced no usable count.
    pub tally: Option<Tally>,
    /// Everything the routine wrote while running.
    pub log: String,
}

impl AcceleratorOutput {
    pub fn counted(tally: Tally, log: impl Into<String>) -> Self {
        Self {
            tally: Some(tally),
            log: log.into(),
        }
    }

    pub fn without_tally(log: impl Into<String>) -> Self {
        Self {
            tally: None,
            log: log.into(),
        }
    }
}

/// Classified accelerator result.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Counted(Tally),
    Exhausted,
    /// Any other failure. Not worth retrying on a smaller slab.
    Failed(String),
}

/// Scans accelerator logs for exhaustion markers, ignoring case.
#[derive(Debug, Clone)]
pub struct ExhaustionDetector {
    markers: Vec<String>,
}

impl Default for ExhaustionDetector {
    fn default() -> Self {
        Self::new(DEFAULT_EXHAUSTION_MARKERS.iter().copied())
    }
}

impl ExhaustionDetector {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(|m| m.as_ref().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    pub fn is_exhausted(&self, log: &str) -> bool {
        let log = log.to_lowercase();
        self.markers.iter().any(|m| log.contains(m.as_str()))
    }

    /// A marker in the log wins over any tally, so a partial count from an
    /// exhausted run is never used.
    pub fn classify(&self, result: Result<AcceleratorOutput>) -> Outcome {
        match result {
            Err(e) => Outcome::Failed(e.to_string()),
            Ok(output) if self.is_exhausted(&output.log) => Outcome::Exhausted,
            Ok(AcceleratorOutput {
                tally: Some(tally), ..
            }) => Outcome::Counted(tally),
            Ok(output) => Outcome::Failed(format!(
                "no count reported: {}",
                output.log.lines().last().unwrap_or("empty log")
            )),
        }
    }
}
