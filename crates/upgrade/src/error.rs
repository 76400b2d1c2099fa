//! Error type of the upgrade flow.

use obs_core::VersionParseError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpgradeError {
    #[error("invalid chart version: {0}")]
    Version(#[from] VersionParseError),

    #[error("no upgrade available: release {release} already runs chart {deployed} with the same values")]
    NoUpgradeAvailable { release: String, deployed: String },

    #[error("chart conflict: same-chart mode requested but chart {latest} is newer than deployed {deployed}")]
    ChartConflict { deployed: String, latest: String },

    #[error("upgrade aborted: not confirmed")]
    Aborted,

    #[error("secret {0} not found")]
    MissingSecret(String),

    #[error("secret {secret} is missing key {key:?}")]
    MissingSecretKey { secret: String, key: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{object} is missing field {field}")]
    MissingField { object: String, field: &'static str },

    #[error("pods matching {selector} still running after {attempts} checks; shutdown is taking too long")]
    DrainTimeout { selector: String, attempts: u32 },

    #[error("cancelled while {0}")]
    Cancelled(&'static str),

    #[error("{step} failed: {source:#}")]
    Step {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl UpgradeError {
    /// Errors raised before anything in the cluster was touched.
    pub fn is_pre_mutation(&self) -> bool {
        matches!(
            self,
            UpgradeError::Version(_)
                | UpgradeError::NoUpgradeAvailable { .. }
                | UpgradeError::ChartConflict { .. }
                | UpgradeError::Aborted
        )
    }
}

pub type Result<T> = std::result::Result<T, UpgradeError>;

/// Attach the failing step to a collaborator error.
pub trait StepContext<T> {
    fn step(self, step: &'static str) -> Result<T>;
}

impl<T> StepContext<T> for anyhow::Result<T> {
    fn step(self, step: &'static str) -> Result<T> {
        self.map_err(|source| UpgradeError::Step { step, source })
    }
}
