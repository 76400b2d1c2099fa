//! Per-step outcome of a run, for logs and `--output json`.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Done,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub step: String,
    pub status: StepStatus,
    pub detail: String,
}

impl StepReport {
    pub fn done(step: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { step: step.into(), status: StepStatus::Done, detail: detail.into() }
    }

    pub fn skipped(step: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { step: step.into(), status: StepStatus::Skipped, detail: detail.into() }
    }
}

impl fmt::Display for StepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = match self.status { StepStatus::Done => "✔", StepStatus::Skipped => "-" };
        write!(f, "{} {:<20} {}", mark, self.step, self.detail)
    }
}
