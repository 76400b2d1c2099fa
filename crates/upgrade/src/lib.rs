//! obsctl upgrade: moves a live release of the observability stack to a newer
//! chart, running the one-time migrations each chart layout change needs.

#![forbid(unsafe_code)]

pub mod error;
pub mod inspector;
pub mod ledger;
pub mod mock;
pub mod names;
pub mod orchestrator;
pub mod poll;
pub mod reconciler;
pub mod report;
pub mod secrets;
pub mod volume;

pub use error::{Result, UpgradeError};
pub use inspector::{DeploymentInspector, InspectRequest, Inspection, UpgradePlan};
pub use ledger::{MigrationLedger, MigrationStep};
pub use names::ResourceNames;
pub use orchestrator::{Confirm, OutcomeKind, StdinConfirm, UpgradeOrchestrator, UpgradeOutcome, UpgradeRequest};
pub use poll::{poll_until, PollError, PollPolicy};
pub use reconciler::ClusterResourceReconciler;
pub use report::{StepReport, StepStatus};
pub use secrets::SecretMigrator;
pub use volume::{PermissionFixJob, VolumeMigrator};
