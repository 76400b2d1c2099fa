//! obsctl core types: release snapshots, chart targets and migration decisions.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod version;

pub use version::{ordinal, ChartVersion, Ordinal, VersionParseError, DEFAULT_ORDINAL_WIDTH};

/// Last chart version whose layout still uses the legacy secret names.
pub const SECRET_BOUNDARY: &str = "0.2.2";

/// First chart version that ships the operator-managed Prometheus layout.
pub const RESOURCE_BOUNDARY: &str = "0.4.0";

/// Snapshot of a deployed release, fetched once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployedRelease {
    pub release_name: String,
    pub namespace: String,
    pub chart_name: String,
    pub chart_version: String,
    /// Fully computed values of the live release (`helm get values --all`).
    pub computed_values: serde_json::Value,
}

/// The chart a caller wants to move to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetChart {
    pub chart_reference: String,
    pub requested_version: Option<String>,
    pub override_values_file: Option<PathBuf>,
}

/// Chart metadata as published by the chart source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartMetadata {
    pub name: String,
    pub version: String,
    #[serde(default, rename = "appVersion")]
    pub app_version: Option<String>,
}

/// Storage identity of a bound claim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    pub pvc_name: String,
    pub pv_name: String,
    pub access_modes: Vec<String>,
    /// Requested storage, as a quantity string (`8Gi`).
    pub capacity: Option<String>,
    pub volume_mode: Option<String>,
    pub labels: BTreeMap<String, String>,
}

/// What a single run has to do. Derived on every invocation, never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationDecision {
    pub crosses_secret_boundary: bool,
    pub crosses_resource_boundary: bool,
    /// Resource boundary crossed for the first time (deployed < 0.4.0).
    pub requires_volume_migration: bool,
    pub is_no_op: bool,
    pub requires_fresh_install: bool,
}

impl MigrationDecision {
    pub fn fresh_install() -> Self {
        Self { requires_fresh_install: true, ..Self::default() }
    }

    /// Decide the migration path between two versions.
    ///
    /// `values_equal` is only consulted when the target is not newer than the
    /// deployed chart.
    pub fn between(deployed: &str, target: &str, values_equal: bool) -> Result<Self, VersionParseError> {
        let deployed = ordinal(deployed, DEFAULT_ORDINAL_WIDTH)?;
        let target = ordinal(target, DEFAULT_ORDINAL_WIDTH)?;
        let secret = ordinal(SECRET_BOUNDARY, DEFAULT_ORDINAL_WIDTH)?;
        let resource = ordinal(RESOURCE_BOUNDARY, DEFAULT_ORDINAL_WIDTH)?;

        let crosses_resource_boundary = target >= resource && target != deployed;
        Ok(Self {
            crosses_secret_boundary: deployed <= secret && secret < target,
            crosses_resource_boundary,
            requires_volume_migration: crosses_resource_boundary && deployed < resource,
            is_no_op: target <= deployed && values_equal,
            requires_fresh_install: false,
        })
    }

    pub fn needs_migration(&self) -> bool {
        self.crosses_secret_boundary || self.crosses_resource_boundary
    }
}

pub mod prelude {
    pub use super::{
        ChartMetadata, ChartVersion, DeployedRelease, MigrationDecision, Ordinal, TargetChart, VersionParseError,
        VolumeBinding,
    };
}
