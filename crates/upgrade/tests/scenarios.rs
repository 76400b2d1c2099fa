#![forbid(unsafe_code)]

use std::time::Duration;

use obs_apply::CrdManifestSet;
use obs_core::TargetChart;
use obs_helm::DEFAULT_CHART_REFERENCE;
use obs_upgrade::mock::{release, secret, with_legacy_prometheus, CallLog, MockCharts, MockCluster, MockManifests, ScriptedConfirm};
use obs_upgrade::{
    OutcomeKind, PollPolicy, ResourceNames, StepStatus, UpgradeError, UpgradeOrchestrator, UpgradeOutcome,
    UpgradeRequest,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

const CRDS: &str = "version: v9.9.9\nmanifests:\n  - kind: prometheuses\n    url: https://crds.test/{version}/prometheuses.yaml\n  - kind: servicemonitors\n    url: https://crds.test/{version}/servicemonitors.yaml\n";

fn crds() -> CrdManifestSet { CrdManifestSet::from_yaml(CRDS).expect("crd set") }

fn fast() -> PollPolicy { PollPolicy { step: Duration::from_millis(1), max_attempts: 10, deadline: None } }

fn target_values() -> Value { json!({"promscale": {"enabled": true}, "timescaledb-single": {"replicaCount": 1}}) }

fn manifests(log: &CallLog) -> MockManifests {
    MockManifests::new(log.clone())
        .serve("https://crds.test/v9.9.9/prometheuses.yaml", "# prometheuses\nkind: CustomResourceDefinition\n")
        .serve("https://crds.test/v9.9.9/servicemonitors.yaml", "# servicemonitors\nkind: CustomResourceDefinition\n")
}

/// A release on the oldest layout: legacy secrets, node exporter, Prometheus
/// running as a Deployment.
fn legacy_cluster(log: &CallLog, with_backup: bool) -> MockCluster {
    let names = ResourceNames::new("tobs");
    let mut cluster = MockCluster::new(log.clone())
        .with_secret(secret(
            "tobs-timescaledb-passwords",
            &[("admin", b"adm1n"), ("postgres", b"sup3r"), ("standby", b"r3pl")],
        ))
        .with_secret(secret("tobs-timescaledb-certificate", &[("tls.crt", b"CRT"), ("tls.key", b"KEY")]))
        .with_daemonset(&names.node_exporter())
        .with_service(&names.node_exporter());
    if with_backup {
        cluster = cluster.with_secret(secret(
            "tobs-timescaledb-pgbackrest",
            &[("pgbackrest.conf", b"[global]\nrepo1-s3-bucket=metrics\nrepo1-s3-region=eu-west-1\nrepo1-path=/db\n")],
        ));
    }
    with_legacy_prometheus(cluster, &names, "pv-0001")
}

fn request() -> UpgradeRequest {
    let target = TargetChart { chart_reference: DEFAULT_CHART_REFERENCE.into(), ..Default::default() };
    let mut req = UpgradeRequest::new("tobs", "obs", target);
    req.repo_url = "https://charts.test".into();
    req
}

struct Harness {
    log: CallLog,
    charts: MockCharts,
    cluster: MockCluster,
    manifests: MockManifests,
    confirm: ScriptedConfirm,
}

impl Harness {
    fn new(deployed: Option<(&str, Value)>, latest: &str, cluster: impl FnOnce(&CallLog) -> MockCluster) -> Self {
        let log = CallLog::default();
        let current = deployed.map(|(v, values)| release("tobs", "obs", v, values));
        Self {
            charts: MockCharts::new(log.clone(), current, latest, target_values()),
            cluster: cluster(&log),
            manifests: manifests(&log),
            confirm: ScriptedConfirm::new(true),
            log,
        }
    }

    async fn run(&self, req: &UpgradeRequest) -> Result<UpgradeOutcome, UpgradeError> {
        UpgradeOrchestrator::new(&self.charts, &self.cluster, &self.manifests, &self.confirm, crds())
            .with_poll(fast())
            .run(req)
            .await
    }

    fn pos(&self, prefix: &str) -> usize {
        self.log.position(prefix).unwrap_or_else(|| panic!("{prefix} not called: {:#?}", self.log.entries()))
    }
}

#[tokio::test]
async fn scenario_a_full_migration_order() {
    let h = Harness::new(Some(("0.2.0", json!({"old": true}))), "0.5.0", |l| legacy_cluster(l, true));
    let out = h.run(&request()).await.expect("upgrade");

    assert_eq!(out.kind, OutcomeKind::Upgraded);
    assert!(out.decision.crosses_secret_boundary && out.decision.crosses_resource_boundary);
    assert!(out.decision.requires_volume_migration);
    assert_eq!(h.confirm.asked(), 1);

    let sequence = [
        "apply_raw_manifest # prometheuses",
        "apply_raw_manifest # servicemonitors",
        "delete_daemonset tobs-prometheus-node-exporter",
        "delete_service tobs-prometheus-node-exporter",
        "update_deployment tobs-prometheus-server",
        "list_pods",
        "update_pv pv-0001",
        "create_pvc prometheus-tobs-",
        "create_job tobs-prometheus-permission-change",
        "create_secret tobs-credentials",
        "create_secret tobs-certificate",
        "create_secret tobs-pgbackrest",
        "delete_job tobs-grafana-db",
        "apply_chart tobs",
    ];
    let positions: Vec<usize> = sequence.iter().map(|s| h.pos(s)).collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "out of order: {:#?}", h.log.entries());

    assert_eq!(h.log.count("apply_chart"), 1);
    let applied = h.charts.applied();
    assert_eq!(applied[0].version.as_deref(), Some("0.5.0"));
    let live = h.charts.release().expect("release");
    assert_eq!(live.chart_version, "0.5.0");
    assert_eq!(live.computed_values, target_values());

    let backup = h.cluster.secret("tobs-pgbackrest").expect("backup secret").data.unwrap();
    assert_eq!(backup.len(), 2);
    assert_eq!(backup["PGBACKREST_REPO1_S3_BUCKET"].0, b"metrics");
    assert!(h.cluster.secret("tobs-timescaledb-passwords").is_some());
}

#[tokio::test]
async fn scenario_b_no_op_has_zero_writes() {
    let h = Harness::new(Some(("0.5.0", target_values())), "0.5.0", |l| legacy_cluster(l, true));
    let err = h.run(&request()).await.unwrap_err();
    assert!(matches!(err, UpgradeError::NoUpgradeAvailable { .. }), "{err}");
    assert!(h.log.mutations().is_empty(), "{:#?}", h.log.mutations());
    assert_eq!(h.confirm.asked(), 0);
}

#[tokio::test]
async fn scenario_c_missing_backup_is_skipped() {
    let h = Harness::new(Some(("0.2.0", json!({}))), "0.3.0", |l| legacy_cluster(l, false));
    let out = h.run(&request()).await.expect("upgrade");

    assert!(out.decision.crosses_secret_boundary);
    assert!(!out.decision.crosses_resource_boundary);
    assert!(h.cluster.secret("tobs-credentials").is_some());
    assert!(h.cluster.secret("tobs-certificate").is_some());
    assert!(h.cluster.secret("tobs-pgbackrest").is_none());
    let backup = out.steps.iter().find(|s| s.step == "backup-secret").expect("backup step");
    assert_eq!(backup.status, StepStatus::Skipped);
    assert!(h.log.position("apply_raw_manifest").is_none());
    assert!(h.log.position("update_deployment").is_none());
    assert_eq!(h.log.count("apply_chart"), 1);
}

#[tokio::test]
async fn same_chart_conflict_before_any_write() {
    let h = Harness::new(Some(("0.4.0", json!({}))), "0.5.0", |l| legacy_cluster(l, true));
    let mut req = request();
    req.same_chart = true;
    let err = h.run(&req).await.unwrap_err();
    assert!(matches!(err, UpgradeError::ChartConflict { .. }), "{err}");
    assert!(err.is_pre_mutation());
    assert!(h.log.mutations().is_empty());
}

#[tokio::test]
async fn cluster_resources_precede_secrets_across_both_boundaries() {
    let h = Harness::new(Some(("0.1.0", json!({}))), "0.5.0", |l| legacy_cluster(l, true));
    h.run(&request()).await.expect("upgrade");

    let last_cluster_step = h.log.last_position("create_job tobs-prometheus-permission-change").expect("job");
    let first_secret = h.pos("create_secret");
    assert!(last_cluster_step < first_secret, "{:#?}", h.log.entries());
    assert!(h.pos("apply_raw_manifest") < first_secret);
}

#[tokio::test]
async fn missing_release_installs_without_migrating() {
    let h = Harness::new(None, "0.5.0", |l| legacy_cluster(l, true));
    let out = h.run(&request()).await.expect("install");
    assert_eq!(out.kind, OutcomeKind::Installed);
    assert!(out.decision.requires_fresh_install);
    assert_eq!(h.log.mutations(), ["install_chart tobs"]);
    assert_eq!(h.confirm.asked(), 0);
}

#[tokio::test]
async fn declined_confirmation_changes_nothing() {
    let mut h = Harness::new(Some(("0.2.0", json!({}))), "0.5.0", |l| legacy_cluster(l, true));
    h.confirm = ScriptedConfirm::new(false);
    let err = h.run(&request()).await.unwrap_err();
    assert!(matches!(err, UpgradeError::Aborted), "{err}");
    assert!(h.log.mutations().is_empty());
}

#[tokio::test]
async fn manifest_fetch_failure_aborts_before_secrets_and_chart() {
    let log = CallLog::default();
    let h = Harness {
        charts: MockCharts::new(log.clone(), Some(release("tobs", "obs", "0.2.0", json!({}))), "0.5.0", target_values()),
        cluster: legacy_cluster(&log, true),
        manifests: MockManifests::new(log.clone())
            .serve("https://crds.test/v9.9.9/prometheuses.yaml", "# prometheuses\n"),
        confirm: ScriptedConfirm::new(true),
        log,
    };
    let err = h.run(&request()).await.unwrap_err();
    assert!(err.to_string().contains("fetch CRD manifest failed"), "{err}");
    assert!(err.to_string().contains("HTTP 404"), "{err}");
    assert_eq!(h.cluster.applied_manifests().len(), 1);
    assert!(h.log.position("create_secret").is_none());
    assert!(h.log.position("apply_chart").is_none());
}

#[tokio::test]
async fn stuck_drain_aborts_before_chart_apply() {
    let h = Harness::new(Some(("0.3.0", json!({}))), "0.4.0", |l| legacy_cluster(l, true).drain_after(None));
    let req = request();
    let err = UpgradeOrchestrator::new(&h.charts, &h.cluster, &h.manifests, &h.confirm, crds())
        .with_poll(PollPolicy { max_attempts: 2, ..fast() })
        .run(&req)
        .await
        .unwrap_err();
    assert!(matches!(err, UpgradeError::DrainTimeout { attempts: 3, .. }), "{err}");
    assert!(h.log.position("update_pv").is_none());
    assert!(h.log.position("apply_chart").is_none());
}

#[tokio::test]
async fn rerun_after_partial_failure_skips_recorded_steps() {
    let h = Harness::new(Some(("0.2.0", json!({}))), "0.5.0", |l| legacy_cluster(l, true));
    h.cluster.fail_on("create_secret tobs-certificate");
    let err = h.run(&request()).await.unwrap_err();
    assert!(matches!(err, UpgradeError::Step { step: "create migrated secret", .. }), "{err}");
    assert!(h.log.position("apply_chart").is_none());
    assert!(h.cluster.config_map("tobs-migration-volume-rebind").is_some());
    assert!(h.cluster.config_map("tobs-migration-credentials-secret").is_some());

    h.cluster.clear_failures();
    let out = h.run(&request()).await.expect("second run");

    assert_eq!(h.log.count("create_pvc"), 1);
    assert_eq!(h.log.count("create_job tobs-prometheus-permission-change"), 1);
    assert_eq!(h.log.count("update_deployment"), 1);
    assert_eq!(h.log.count("create_secret tobs-credentials"), 1);
    assert!(h.cluster.secret("tobs-certificate").is_some());
    assert!(h.cluster.secret("tobs-pgbackrest").is_some());
    assert_eq!(h.log.count("apply_chart"), 1);

    let skipped: Vec<&str> =
        out.steps.iter().filter(|s| s.status == StepStatus::Skipped).map(|s| s.step.as_str()).collect();
    assert!(skipped.contains(&"volume-migration"), "{skipped:?}");
    assert!(skipped.contains(&"credentials-secret"), "{skipped:?}");
}

#[tokio::test]
async fn cancelled_run_stops_before_migrating() {
    let h = Harness::new(Some(("0.2.0", json!({}))), "0.3.0", |l| legacy_cluster(l, true));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut req = request();
    req.confirm = true;
    let err = UpgradeOrchestrator::new(&h.charts, &h.cluster, &h.manifests, &h.confirm, crds())
        .with_poll(fast())
        .with_cancel(cancel)
        .run(&req)
        .await
        .unwrap_err();
    assert!(matches!(err, UpgradeError::Cancelled("migrating secrets")), "{err}");
    assert!(h.log.mutations().is_empty(), "{:#?}", h.log.mutations());
    assert!(h.cluster.secret("tobs-credentials").is_none());
}

#[tokio::test]
async fn cancelled_run_does_not_prompt() {
    let h = Harness::new(Some(("0.2.0", json!({}))), "0.5.0", |l| legacy_cluster(l, true));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = UpgradeOrchestrator::new(&h.charts, &h.cluster, &h.manifests, &h.confirm, crds())
        .with_cancel(cancel)
        .run(&request())
        .await
        .unwrap_err();
    assert!(matches!(err, UpgradeError::Cancelled(_)), "{err}");
    assert_eq!(h.confirm.asked(), 0);
    assert!(h.log.mutations().is_empty());
}

#[tokio::test]
async fn chart_apply_failure_keeps_migration_markers() {
    let h = Harness::new(Some(("0.2.0", json!({}))), "0.5.0", |l| legacy_cluster(l, true));
    h.charts.fail_apply(true);
    let err = h.run(&request()).await.unwrap_err();
    assert!(matches!(err, UpgradeError::Step { step: "apply chart", .. }), "{err}");
    assert!(!err.is_pre_mutation());
    for step in ["volume-rebind", "permission-job", "credentials-secret", "certificate-secret", "backup-secret"] {
        let marker = format!("tobs-migration-{}", step);
        assert!(h.cluster.config_map(&marker).is_some(), "missing marker {marker}");
    }
    assert_eq!(h.charts.release().expect("release").chart_version, "0.2.0");

    h.charts.fail_apply(false);
    let out = h.run(&request()).await.expect("retry");
    assert_eq!(out.to_version, "0.5.0");
    assert_eq!(h.log.count("create_secret tobs-credentials"), 1);
    assert_eq!(h.log.count("create_pvc"), 1);
    assert_eq!(h.log.count("apply_chart"), 2);
}
