//! Cluster-stored record of completed migration steps.
//!
//! Every step that creates objects writes a marker ConfigMap once it succeeds.
//! A later run finds the marker and skips the step instead of failing on
//! "already exists".

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use obs_kubehub::ClusterService;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, StepContext};
use crate::names::{ResourceNames, MANAGED_BY, MANAGED_BY_LABEL};

pub const RELEASE_LABEL: &str = "obsctl.io/release";
pub const STEP_LABEL: &str = "obsctl.io/migration-step";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStep {
    CredentialsSecret,
    CertificateSecret,
    BackupSecret,
    VolumeRebind,
    PermissionJob,
}

impl MigrationStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStep::CredentialsSecret => "credentials-secret",
            MigrationStep::CertificateSecret => "certificate-secret",
            MigrationStep::BackupSecret => "backup-secret",
            MigrationStep::VolumeRebind => "volume-rebind",
            MigrationStep::PermissionJob => "permission-job",
        }
    }
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

pub struct MigrationLedger<'a> {
    cluster: &'a dyn ClusterService,
    namespace: String,
    names: ResourceNames,
    from_version: String,
    to_version: String,
}

impl<'a> MigrationLedger<'a> {
    pub fn new(
        cluster: &'a dyn ClusterService,
        namespace: impl Into<String>,
        names: ResourceNames,
        from_version: impl Into<String>,
        to_version: impl Into<String>,
    ) -> Self {
        Self { cluster, namespace: namespace.into(), names, from_version: from_version.into(), to_version: to_version.into() }
    }

    pub async fn is_done(&self, step: MigrationStep) -> Result<bool> {
        let name = self.names.migration_marker(step.as_str());
        let found = self.cluster.get_config_map(&self.namespace, &name).await.step("read migration marker")?;
        Ok(found.is_some())
    }

    pub async fn record(&self, step: MigrationStep) -> Result<()> {
        let name = self.names.migration_marker(step.as_str());
        let labels = BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
            (RELEASE_LABEL.to_string(), self.names.release().to_string()),
            (STEP_LABEL.to_string(), step.as_str().to_string()),
        ]);
        let data = BTreeMap::from([
            ("completedAt".to_string(), chrono::Utc::now().to_rfc3339()),
            ("fromVersion".to_string(), self.from_version.clone()),
            ("toVersion".to_string(), self.to_version.clone()),
        ]);
        let cm = ConfigMap {
            metadata: ObjectMeta { name: Some(name.clone()), labels: Some(labels), ..Default::default() },
            data: Some(data),
            ..Default::default()
        };
        self.cluster.create_config_map(&self.namespace, &cm).await.step("write migration marker")?;
        info!(marker = %name, step = %step, "migration step recorded");
        Ok(())
    }
}
