//! Object names and fixed values of the stack's chart layouts.

/// Legacy credential keys and the keys they move to.
pub const CREDENTIAL_KEYS: [(&str, &str); 3] = [
    ("admin", "PATRONI_admin_PASSWORD"),
    ("postgres", "PATRONI_SUPERUSER_PASSWORD"),
    ("standby", "PATRONI_REPLICATION_PASSWORD"),
];

/// Key of the flat config blob inside the legacy backup secret.
pub const LEGACY_BACKUP_KEY: &str = "pgbackrest.conf";

/// Substring marking an S3 repository option in the backup config.
pub const BACKUP_S3_MARKER: &str = "-s3-";

/// Prefix the backup agent expects on environment-style options.
pub const BACKUP_ENV_PREFIX: &str = "PGBACKREST_";

pub const PERMISSION_JOB_IMAGE: &str = "alpine";
pub const PROMETHEUS_UID: i64 = 1000;
pub const PROMETHEUS_GID: i64 = 2000;
pub const PROMETHEUS_DATA_PATH: &str = "/prometheus";
pub const PERMISSION_JOB_BACKOFF: i32 = 4;

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "obsctl";

/// Names of every object the migrations read, create or delete, derived from
/// the release name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    release: String,
}

impl ResourceNames {
    pub fn new(release: impl Into<String>) -> Self { Self { release: release.into() } }

    pub fn release(&self) -> &str { &self.release }

    pub fn legacy_credentials(&self) -> String { format!("{}-timescaledb-passwords", self.release) }
    pub fn credentials(&self) -> String { format!("{}-credentials", self.release) }
    pub fn legacy_certificate(&self) -> String { format!("{}-timescaledb-certificate", self.release) }
    pub fn certificate(&self) -> String { format!("{}-certificate", self.release) }
    pub fn legacy_backup(&self) -> String { format!("{}-timescaledb-pgbackrest", self.release) }
    pub fn backup(&self) -> String { format!("{}-pgbackrest", self.release) }

    /// Job whose spec changed incompatibly in 0.2.2 charts.
    pub fn stale_grafana_job(&self) -> String { format!("{}-grafana-db", self.release) }

    /// Node exporter objects the 0.4.0 layout no longer manages.
    pub fn node_exporter(&self) -> String { format!("{}-prometheus-node-exporter", self.release) }

    pub fn prometheus_deployment(&self) -> String { format!("{}-prometheus-server", self.release) }
    pub fn prometheus_pod_selector(&self) -> String {
        format!("app=prometheus,component=server,release={}", self.release)
    }
    pub fn legacy_prometheus_pvc(&self) -> String { format!("{}-prometheus-server", self.release) }
    /// Claim name the operator-managed StatefulSet looks for.
    pub fn prometheus_pvc(&self) -> String {
        format!(
            "prometheus-{r}-kube-prometheus-prometheus-db-prometheus-{r}-kube-prometheus-prometheus-0",
            r = self.release
        )
    }
    pub fn permission_job(&self) -> String { format!("{}-prometheus-permission-change", self.release) }

    pub fn migration_marker(&self, step: &str) -> String { format!("{}-migration-{}", self.release, step) }

    pub fn timescaledb_app(&self) -> String { format!("{}-timescaledb", self.release) }
}
