//! Secret migration across the 0.2.2 boundary.
//!
//! The legacy layout kept database credentials, TLS material and backup
//! settings under `*-timescaledb-*` names; newer charts read them from new
//! names and keys. Legacy secrets are only read, never changed.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use obs_kubehub::ClusterService;
use tracing::{info, warn};

use crate::error::{Result, StepContext, UpgradeError};
use crate::ledger::{MigrationLedger, MigrationStep};
use crate::names::{
    ResourceNames, BACKUP_ENV_PREFIX, BACKUP_S3_MARKER, CREDENTIAL_KEYS, LEGACY_BACKUP_KEY, MANAGED_BY,
    MANAGED_BY_LABEL,
};
use crate::report::StepReport;

/// Labels put on every secret the migration creates.
pub fn migrated_labels(names: &ResourceNames) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), names.timescaledb_app()),
        ("cluster-name".to_string(), names.release().to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
    ])
}

fn new_secret(name: String, names: &ResourceNames, type_: Option<String>, data: BTreeMap<String, ByteString>) -> Secret {
    Secret {
        metadata: ObjectMeta { name: Some(name), labels: Some(migrated_labels(names)), ..Default::default() },
        type_,
        data: Some(data),
        ..Default::default()
    }
}

/// Credentials under the new name and keys. Payloads are copied byte for byte;
/// all three legacy keys must be present.
pub fn build_credentials_secret(legacy: &Secret, names: &ResourceNames) -> Result<Secret> {
    let legacy_name = names.legacy_credentials();
    let empty = BTreeMap::new();
    let data = legacy.data.as_ref().unwrap_or(&empty);
    let mut out = BTreeMap::new();
    for (old_key, new_key) in CREDENTIAL_KEYS {
        let value = data.get(old_key).ok_or_else(|| UpgradeError::MissingSecretKey {
            secret: legacy_name.clone(),
            key: old_key.to_string(),
        })?;
        out.insert(new_key.to_string(), value.clone());
    }
    Ok(new_secret(names.credentials(), names, Some("Opaque".into()), out))
}

/// TLS secret under the new name with an identical byte map.
pub fn build_certificate_secret(legacy: &Secret, names: &ResourceNames) -> Secret {
    new_secret(names.certificate(), names, legacy.type_.clone(), legacy.data.clone().unwrap_or_default())
}

/// `repo1-s3-bucket` -> `PGBACKREST_REPO1_S3_BUCKET`
pub fn backup_env_key(key: &str) -> String {
    format!("{}{}", BACKUP_ENV_PREFIX, key.replace('-', "_").to_uppercase())
}

/// Keep the S3 options of a flat `key=value` backup config, keyed the way the
/// backup agent reads them from its environment.
pub fn parse_backup_config(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .filter(|(k, _)| k.contains(BACKUP_S3_MARKER))
        .map(|(k, v)| (backup_env_key(k), v.to_string()))
        .collect()
}

pub fn build_backup_secret(legacy: &Secret, names: &ResourceNames) -> Result<Secret> {
    let blob = legacy
        .data
        .as_ref()
        .and_then(|d| d.get(LEGACY_BACKUP_KEY))
        .ok_or_else(|| UpgradeError::MissingSecretKey { secret: names.legacy_backup(), key: LEGACY_BACKUP_KEY.into() })?;
    let text = String::from_utf8_lossy(&blob.0);
    let data = parse_backup_config(&text).into_iter().map(|(k, v)| (k, ByteString(v.into_bytes()))).collect();
    Ok(new_secret(names.backup(), names, Some("Opaque".into()), data))
}

pub struct SecretMigrator<'a> {
    cluster: &'a dyn ClusterService,
    ledger: &'a MigrationLedger<'a>,
    names: &'a ResourceNames,
    namespace: &'a str,
}

impl<'a> SecretMigrator<'a> {
    pub fn new(cluster: &'a dyn ClusterService, ledger: &'a MigrationLedger<'a>, names: &'a ResourceNames, namespace: &'a str) -> Self {
        Self { cluster, ledger, names, namespace }
    }

    async fn read(&self, name: &str, step: &'static str) -> Result<Option<Secret>> {
        self.cluster.get_secret(self.namespace, name).await.step(step)
    }

    /// Read and validate everything first, then create. A missing legacy
    /// secret or key fails the run before any secret is written.
    pub async fn run(&self) -> Result<Vec<StepReport>> {
        let mut reports = Vec::new();
        let mut pending: Vec<(MigrationStep, Secret)> = Vec::new();

        if self.ledger.is_done(MigrationStep::CredentialsSecret).await? {
            reports.push(StepReport::skipped(MigrationStep::CredentialsSecret.as_str(), "already migrated"));
        } else {
            let name = self.names.legacy_credentials();
            let legacy = self.read(&name, "read legacy credentials").await?.ok_or_else(|| UpgradeError::MissingSecret(name.clone()))?;
            pending.push((MigrationStep::CredentialsSecret, build_credentials_secret(&legacy, self.names)?));
        }

        if self.ledger.is_done(MigrationStep::CertificateSecret).await? {
            reports.push(StepReport::skipped(MigrationStep::CertificateSecret.as_str(), "already migrated"));
        } else {
            let name = self.names.legacy_certificate();
            let legacy = self.read(&name, "read legacy certificate").await?.ok_or_else(|| UpgradeError::MissingSecret(name.clone()))?;
            pending.push((MigrationStep::CertificateSecret, build_certificate_secret(&legacy, self.names)));
        }

        if self.ledger.is_done(MigrationStep::BackupSecret).await? {
            reports.push(StepReport::skipped(MigrationStep::BackupSecret.as_str(), "already migrated"));
        } else {
            let name = self.names.legacy_backup();
            match self.read(&name, "read legacy backup config").await? {
                Some(legacy) => pending.push((MigrationStep::BackupSecret, build_backup_secret(&legacy, self.names)?)),
                None => {
                    info!(secret = %name, "no legacy backup config; backup migration skipped");
                    reports.push(StepReport::skipped(MigrationStep::BackupSecret.as_str(), "backup not configured"));
                }
            }
        }

        for (step, secret) in pending {
            let name = secret.metadata.name.clone().unwrap_or_default();
            self.cluster.create_secret(self.namespace, &secret).await.step("create migrated secret")?;
            self.ledger.record(step).await?;
            info!(secret = %name, keys = secret.data.as_ref().map(|d| d.len()).unwrap_or(0), "secret migrated");
            reports.push(StepReport::done(step.as_str(), name));
        }

        let job = self.names.stale_grafana_job();
        if self.cluster.delete_job(self.namespace, &job).await.step("delete stale grafana job")? {
            reports.push(StepReport::done("stale-job", job));
        } else {
            warn!(job = %job, "stale job not found; nothing to delete");
            reports.push(StepReport::skipped("stale-job", "not found"));
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{secret, CallLog, MockCluster};

    fn names() -> ResourceNames { ResourceNames::new("tobs") }

    #[test]
    fn credentials_keep_payloads_under_new_keys() {
        let legacy = secret(
            "tobs-timescaledb-passwords",
            &[("admin", b"a\x00dm1n"), ("postgres", b"p@ss"), ("standby", b"st"), ("extra", b"x")],
        );
        let s = build_credentials_secret(&legacy, &names()).expect("complete legacy secret");
        assert_eq!(s.metadata.name.as_deref(), Some("tobs-credentials"));
        let data = s.data.unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data["PATRONI_admin_PASSWORD"].0, b"a\x00dm1n");
        assert_eq!(data["PATRONI_SUPERUSER_PASSWORD"].0, b"p@ss");
        assert_eq!(data["PATRONI_REPLICATION_PASSWORD"].0, b"st");
        assert_eq!(s.metadata.labels.unwrap()["cluster-name"], "tobs");
    }

    #[test]
    fn credentials_require_every_key() {
        let legacy = secret("tobs-timescaledb-passwords", &[("admin", b"a"), ("postgres", b"p")]);
        let err = build_credentials_secret(&legacy, &names()).unwrap_err();
        assert!(matches!(err, UpgradeError::MissingSecretKey { ref key, .. } if key == "standby"), "{err}");
    }

    #[test]
    fn backup_config_keeps_s3_options_only() {
        let parsed = parse_backup_config("a-s3-b=1\nunrelated=2\nc-s3-d=3\n");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["PGBACKREST_A_S3_B"], "1");
        assert_eq!(parsed["PGBACKREST_C_S3_D"], "3");
    }

    #[test]
    fn backup_config_ignores_noise() {
        let parsed = parse_backup_config("[global]\n# repo1-s3-key\n\nrepo1-s3-bucket = my=bucket\nrepo1-path=/x\n");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed["PGBACKREST_REPO1_S3_BUCKET"], "my=bucket");
    }

    #[test]
    fn backup_config_skips_commented_options() {
        let parsed = parse_backup_config("# repo1-s3-key=old
;repo1-s3-region=x
  # repo1-s3-token=t
repo1-s3-bucket=b
");
        assert_eq!(parsed.len(), 1, "{parsed:?}");
        assert_eq!(parsed["PGBACKREST_REPO1_S3_BUCKET"], "b");
    }

    #[test]
    fn certificate_copied_verbatim() {
        let mut legacy = secret("tobs-timescaledb-certificate", &[("tls.crt", b"CRT"), ("tls.key", b"KEY")]);
        legacy.type_ = Some("kubernetes.io/tls".into());
        let s = build_certificate_secret(&legacy, &names());
        assert_eq!(s.metadata.name.as_deref(), Some("tobs-certificate"));
        assert_eq!(s.type_.as_deref(), Some("kubernetes.io/tls"));
        assert_eq!(s.data, legacy.data);
    }

    #[tokio::test]
    async fn missing_key_aborts_before_any_write() {
        let log = CallLog::default();
        let cluster = MockCluster::new(log.clone())
            .with_secret(secret("tobs-timescaledb-passwords", &[("admin", b"a"), ("postgres", b"p")]))
            .with_secret(secret("tobs-timescaledb-certificate", &[("tls.crt", b"CRT")]));
        let names = names();
        let ledger = MigrationLedger::new(&cluster, "obs", names.clone(), "0.2.0", "0.3.0");
        let err = SecretMigrator::new(&cluster, &ledger, &names, "obs").run().await.unwrap_err();
        assert!(matches!(err, UpgradeError::MissingSecretKey { .. }), "{err}");
        assert!(log.mutations().is_empty(), "unexpected writes: {:?}", log.mutations());
    }

    #[tokio::test]
    async fn missing_certificate_is_fatal() {
        let log = CallLog::default();
        let cluster = MockCluster::new(log.clone())
            .with_secret(secret("tobs-timescaledb-passwords", &[("admin", b"a"), ("postgres", b"p"), ("standby", b"s")]));
        let names = names();
        let ledger = MigrationLedger::new(&cluster, "obs", names.clone(), "0.2.0", "0.3.0");
        let err = SecretMigrator::new(&cluster, &ledger, &names, "obs").run().await.unwrap_err();
        assert!(matches!(err, UpgradeError::MissingSecret(ref n) if n == "tobs-timescaledb-certificate"), "{err}");
        assert!(cluster.secret("tobs-credentials").is_none());
    }

    #[tokio::test]
    async fn legacy_secrets_are_left_untouched() {
        let log = CallLog::default();
        let legacy = secret("tobs-timescaledb-passwords", &[("admin", b"a"), ("postgres", b"p"), ("standby", b"s")]);
        let cluster = MockCluster::new(log.clone())
            .with_secret(legacy.clone())
            .with_secret(secret("tobs-timescaledb-certificate", &[("tls.crt", b"CRT")]))
            .with_secret(secret("tobs-timescaledb-pgbackrest", &[("pgbackrest.conf", b"repo1-s3-region=eu\n")]));
        let names = names();
        let ledger = MigrationLedger::new(&cluster, "obs", names.clone(), "0.2.0", "0.3.0");
        let reports = SecretMigrator::new(&cluster, &ledger, &names, "obs").run().await.expect("migration");
        assert_eq!(cluster.secret("tobs-timescaledb-passwords"), Some(legacy));
        assert_eq!(cluster.secret("tobs-pgbackrest").unwrap().data.unwrap()["PGBACKREST_REPO1_S3_REGION"].0, b"eu");
        assert!(reports.iter().any(|r| r.step == "stale-job"));
        assert!(log.mutations().iter().all(|m| !m.contains("timescaledb-")), "{:?}", log.mutations());
    }

    #[tokio::test]
    async fn stale_grafana_job_is_deleted_when_present() {
        use k8s_openapi::api::batch::v1::Job;

        let log = CallLog::default();
        let stale = Job { metadata: ObjectMeta { name: Some("tobs-grafana-db".into()), ..Default::default() }, ..Default::default() };
        let cluster = MockCluster::new(log.clone())
            .with_secret(secret("tobs-timescaledb-passwords", &[("admin", b"a"), ("postgres", b"p"), ("standby", b"s")]))
            .with_secret(secret("tobs-timescaledb-certificate", &[("tls.crt", b"CRT")]))
            .with_job(stale);
        let names = names();
        let ledger = MigrationLedger::new(&cluster, "obs", names.clone(), "0.2.0", "0.3.0");
        let reports = SecretMigrator::new(&cluster, &ledger, &names, "obs").run().await.expect("migration");

        assert!(cluster.job("tobs-grafana-db").is_none());
        let stale = reports.iter().find(|r| r.step == "stale-job").expect("stale job step");
        assert_eq!(stale.status, crate::report::StepStatus::Done);
        assert_eq!(stale.detail, "tobs-grafana-db");
        assert!(log.position("create_secret").unwrap() < log.position("delete_job").unwrap());
    }
}
