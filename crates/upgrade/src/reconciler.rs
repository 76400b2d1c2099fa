//! Cluster-wide resource changes for the 0.4.0 layout: operator CRDs, the
//! node exporter hand-over and, when the old layout is still running, the
//! Prometheus volume.

use std::time::Instant;

use metrics::histogram;
use obs_apply::{CrdManifestSet, ManifestSource};
use obs_kubehub::ClusterService;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Result, StepContext, UpgradeError};
use crate::ledger::MigrationLedger;
use crate::names::ResourceNames;
use crate::poll::PollPolicy;
use crate::report::StepReport;
use crate::volume::VolumeMigrator;

pub struct ClusterResourceReconciler<'a> {
    pub cluster: &'a dyn ClusterService,
    pub manifests: &'a dyn ManifestSource,
    pub ledger: &'a MigrationLedger<'a>,
    pub names: &'a ResourceNames,
    pub namespace: &'a str,
    pub crds: &'a CrdManifestSet,
    pub skip_crds: bool,
    pub migrate_volume: bool,
    pub poll: PollPolicy,
    pub cancel: CancellationToken,
}

impl<'a> ClusterResourceReconciler<'a> {
    pub async fn run(&self) -> Result<Vec<StepReport>> {
        let mut reports = Vec::new();
        if self.skip_crds {
            info!("CRD installation skipped on request");
            reports.push(StepReport::skipped("crds", "--skip-crds"));
        } else {
            reports.push(self.apply_crds().await?);
        }
        reports.extend(self.remove_node_exporter().await?);
        if self.migrate_volume {
            if self.cancel.is_cancelled() {
                return Err(UpgradeError::Cancelled("migrating the prometheus volume"));
            }
            let volume = VolumeMigrator::new(self.cluster, self.ledger, self.names, self.namespace, self.poll.clone(), self.cancel.clone());
            reports.extend(volume.run().await?);
        }
        Ok(reports)
    }

    /// Fetch and apply each manifest in order. The first failure stops the
    /// loop; manifests already applied stay.
    async fn apply_crds(&self) -> Result<StepReport> {
        let t0 = Instant::now();
        let set = self.crds.resolved();
        for m in &set {
            if self.cancel.is_cancelled() {
                return Err(UpgradeError::Cancelled("applying CRD manifests"));
            }
            let body = self.manifests.fetch(&m.url).await.step("fetch CRD manifest")?;
            self.cluster.apply_raw_manifest(&body).await.step("apply CRD manifest")?;
            info!(kind = %m.kind, url = %m.url, "CRD applied");
        }
        histogram!("upgrade_crd_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(StepReport::done("crds", format!("{} manifests at {}", set.len(), self.crds.version)))
    }

    async fn remove_node_exporter(&self) -> Result<Vec<StepReport>> {
        let name = self.names.node_exporter();
        let mut reports = Vec::with_capacity(2);
        if self.cluster.delete_daemonset(self.namespace, &name).await.step("delete node exporter daemonset")? {
            reports.push(StepReport::done("node-exporter-daemonset", name.clone()));
        } else {
            warn!(daemonset = %name, "node exporter daemonset not found");
            reports.push(StepReport::skipped("node-exporter-daemonset", "not found"));
        }
        if self.cluster.delete_service(self.namespace, &name).await.step("delete node exporter service")? {
            reports.push(StepReport::done("node-exporter-service", name));
        } else {
            warn!(service = %name, "node exporter service not found");
            reports.push(StepReport::skipped("node-exporter-service", "not found"));
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{CallLog, MockCluster, MockManifests};
    use crate::report::StepStatus;

    const SET: &str = "version: v1.2.3\nmanifests:\n  - kind: A\n    url: https://crds.test/{version}/a.yaml\n  - kind: B\n    url: https://crds.test/{version}/b.yaml\n  - kind: C\n    url: https://crds.test/{version}/c.yaml\n";

    fn reconciler<'a>(
        cluster: &'a MockCluster,
        manifests: &'a MockManifests,
        ledger: &'a MigrationLedger<'a>,
        names: &'a ResourceNames,
        crds: &'a CrdManifestSet,
    ) -> ClusterResourceReconciler<'a> {
        ClusterResourceReconciler {
            cluster,
            manifests,
            ledger,
            names,
            namespace: "obs",
            crds,
            skip_crds: false,
            migrate_volume: false,
            poll: PollPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn applies_crds_in_order_and_removes_exporter() {
        let log = CallLog::default();
        let names = ResourceNames::new("tobs");
        let cluster = MockCluster::new(log.clone()).with_daemonset(&names.node_exporter()).with_service(&names.node_exporter());
        let manifests = MockManifests::new(log.clone())
            .serve("https://crds.test/v1.2.3/a.yaml", "# a\nkind: CustomResourceDefinition\n")
            .serve("https://crds.test/v1.2.3/b.yaml", "# b\nkind: CustomResourceDefinition\n")
            .serve("https://crds.test/v1.2.3/c.yaml", "# c\nkind: CustomResourceDefinition\n");
        let crds = CrdManifestSet::from_yaml(SET).unwrap();
        let ledger = MigrationLedger::new(&cluster, "obs", names.clone(), "0.3.0", "0.4.0");
        let reports = reconciler(&cluster, &manifests, &ledger, &names, &crds).run().await.expect("reconcile");

        let applied: Vec<String> = log.entries().into_iter().filter(|e| e.starts_with("apply_raw_manifest")).collect();
        assert_eq!(applied, ["apply_raw_manifest # a", "apply_raw_manifest # b", "apply_raw_manifest # c"]);
        assert!(!cluster.has_daemonset(&names.node_exporter()));
        assert!(!cluster.has_service(&names.node_exporter()));
        assert!(reports.iter().all(|r| r.status == StepStatus::Done));
    }

    #[tokio::test]
    async fn fetch_failure_stops_remaining_crds() {
        let log = CallLog::default();
        let names = ResourceNames::new("tobs");
        let cluster = MockCluster::new(log.clone());
        let manifests = MockManifests::new(log.clone())
            .serve("https://crds.test/v1.2.3/a.yaml", "# a\n")
            .serve("https://crds.test/v1.2.3/c.yaml", "# c\n");
        let crds = CrdManifestSet::from_yaml(SET).unwrap();
        let ledger = MigrationLedger::new(&cluster, "obs", names.clone(), "0.3.0", "0.4.0");
        let err = reconciler(&cluster, &manifests, &ledger, &names, &crds).run().await.unwrap_err();

        assert!(matches!(err, UpgradeError::Step { step: "fetch CRD manifest", .. }), "{err}");
        assert_eq!(cluster.applied_manifests().len(), 1);
        assert!(log.position("fetch https://crds.test/v1.2.3/c.yaml").is_none());
        assert!(log.position("delete_daemonset").is_none());
    }

    #[tokio::test]
    async fn missing_exporter_objects_are_not_errors() {
        let log = CallLog::default();
        let names = ResourceNames::new("tobs");
        let cluster = MockCluster::new(log.clone());
        let manifests = MockManifests::new(log.clone());
        let crds = CrdManifestSet::from_yaml(SET).unwrap();
        let ledger = MigrationLedger::new(&cluster, "obs", names.clone(), "0.3.0", "0.4.0");
        let mut r = reconciler(&cluster, &manifests, &ledger, &names, &crds);
        r.skip_crds = true;
        let reports = r.run().await.expect("reconcile");
        assert!(log.position("fetch").is_none());
        assert_eq!(reports.iter().filter(|r| r.status == StepStatus::Skipped).count(), 3);
    }

    #[tokio::test]
    async fn cancelled_run_applies_no_crds() {
        let log = CallLog::default();
        let names = ResourceNames::new("tobs");
        let cluster = MockCluster::new(log.clone());
        let manifests = MockManifests::new(log.clone()).serve("https://crds.test/v1.2.3/a.yaml", "# a\n");
        let crds = CrdManifestSet::from_yaml(SET).unwrap();
        let ledger = MigrationLedger::new(&cluster, "obs", names.clone(), "0.3.0", "0.4.0");
        let r = reconciler(&cluster, &manifests, &ledger, &names, &crds);
        r.cancel.cancel();
        let err = r.run().await.unwrap_err();
        assert!(matches!(err, UpgradeError::Cancelled(_)), "{err}");
        assert!(log.position("fetch").is_none());
        assert!(log.mutations().is_empty());
    }
}
