//! Live storage-identity migration of the Prometheus data volume.
//!
//! Older charts run Prometheus as a Deployment on claim
//! `<release>-prometheus-server`; newer charts run an operator-managed
//! StatefulSet that looks for a differently named claim. The existing volume is
//! detached from the old claim and bound to a new claim with the new name, so
//! the data survives. A one-shot job then fixes ownership for the non-root
//! user of the newer image.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, SecurityContext, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use obs_core::VolumeBinding;
use obs_kubehub::ClusterService;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Result, StepContext, UpgradeError};
use crate::ledger::{MigrationLedger, MigrationStep};
use crate::names::{
    ResourceNames, MANAGED_BY, MANAGED_BY_LABEL, PERMISSION_JOB_BACKOFF, PERMISSION_JOB_IMAGE, PROMETHEUS_DATA_PATH,
    PROMETHEUS_GID, PROMETHEUS_UID,
};
use crate::poll::{poll_until, PollError, PollPolicy};
use crate::report::StepReport;

/// Storage identity of a bound claim.
pub fn binding_of(pvc: &PersistentVolumeClaim) -> Result<VolumeBinding> {
    let pvc_name = pvc.metadata.name.clone().unwrap_or_default();
    let spec = pvc.spec.as_ref().ok_or_else(|| UpgradeError::MissingField { object: format!("pvc {}", pvc_name), field: "spec" })?;
    let pv_name = spec
        .volume_name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| UpgradeError::MissingField { object: format!("pvc {}", pvc_name), field: "spec.volumeName" })?;
    let capacity = spec
        .resources
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .map(|q| q.0.clone());
    Ok(VolumeBinding {
        pvc_name,
        pv_name,
        access_modes: spec.access_modes.clone().unwrap_or_default(),
        capacity,
        volume_mode: spec.volume_mode.clone(),
        labels: pvc.metadata.labels.clone().unwrap_or_default(),
    })
}

/// A claim named `name` that binds straight to the volume behind `binding`.
pub fn rebound_claim(binding: &VolumeBinding, name: &str) -> PersistentVolumeClaim {
    let requests = binding
        .capacity
        .as_ref()
        .map(|c| BTreeMap::from([("storage".to_string(), Quantity(c.clone()))]));
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(binding.labels.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(binding.access_modes.clone()),
            resources: Some(VolumeResourceRequirements { requests, ..Default::default() }),
            volume_mode: binding.volume_mode.clone(),
            volume_name: Some(binding.pv_name.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// One-shot ownership repair of a claim's filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionFixJob {
    pub name: String,
    pub image: String,
    pub uid: i64,
    pub gid: i64,
    pub mount_path: String,
    pub pvc_name: String,
    pub backoff_limit: i32,
}

impl PermissionFixJob {
    pub fn for_prometheus(names: &ResourceNames) -> Self {
        Self {
            name: names.permission_job(),
            image: PERMISSION_JOB_IMAGE.into(),
            uid: PROMETHEUS_UID,
            gid: PROMETHEUS_GID,
            mount_path: PROMETHEUS_DATA_PATH.into(),
            pvc_name: names.prometheus_pvc(),
            backoff_limit: PERMISSION_JOB_BACKOFF,
        }
    }

    pub fn command(&self) -> Vec<String> {
        vec!["chown".into(), "-R".into(), format!("{}:{}", self.uid, self.gid), self.mount_path.clone()]
    }

    pub fn to_job(&self) -> Job {
        let labels = BTreeMap::from([
            ("app".to_string(), self.name.clone()),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        ]);
        let volume = "data".to_string();
        Job {
            metadata: ObjectMeta { name: Some(self.name.clone()), labels: Some(labels.clone()), ..Default::default() },
            spec: Some(JobSpec {
                backoff_limit: Some(self.backoff_limit),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                    spec: Some(PodSpec {
                        restart_policy: Some("OnFailure".into()),
                        containers: vec![Container {
                            name: "chown".into(),
                            image: Some(self.image.clone()),
                            command: Some(self.command()),
                            security_context: Some(SecurityContext { run_as_user: Some(0), ..Default::default() }),
                            volume_mounts: Some(vec![VolumeMount {
                                name: volume.clone(),
                                mount_path: self.mount_path.clone(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        volumes: Some(vec![Volume {
                            name: volume,
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: self.pvc_name.clone(),
                                read_only: None,
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

pub struct VolumeMigrator<'a> {
    cluster: &'a dyn ClusterService,
    ledger: &'a MigrationLedger<'a>,
    names: &'a ResourceNames,
    namespace: &'a str,
    policy: PollPolicy,
    cancel: CancellationToken,
}

impl<'a> VolumeMigrator<'a> {
    pub fn new(
        cluster: &'a dyn ClusterService,
        ledger: &'a MigrationLedger<'a>,
        names: &'a ResourceNames,
        namespace: &'a str,
        policy: PollPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self { cluster, ledger, names, namespace, policy, cancel }
    }

    pub async fn run(&self) -> Result<Vec<StepReport>> {
        let rebind_done = self.ledger.is_done(MigrationStep::VolumeRebind).await?;
        let job_done = self.ledger.is_done(MigrationStep::PermissionJob).await?;
        if rebind_done && job_done {
            return Ok(vec![StepReport::skipped("volume-migration", "already migrated")]);
        }

        let mut reports = Vec::new();
        if rebind_done {
            reports.push(StepReport::skipped(MigrationStep::VolumeRebind.as_str(), "already migrated"));
        } else {
            self.scale_down().await?;
            reports.push(StepReport::done("scale-down", self.names.prometheus_deployment()));
            let checks = self.wait_for_drain().await?;
            reports.push(StepReport::done("drain", format!("no pods left after {} checks", checks)));
            let binding = self.rebind_volume().await?;
            self.ledger.record(MigrationStep::VolumeRebind).await?;
            reports.push(StepReport::done(
                MigrationStep::VolumeRebind.as_str(),
                format!("{} -> {} ({})", binding.pvc_name, self.names.prometheus_pvc(), binding.pv_name),
            ));
        }

        if job_done {
            reports.push(StepReport::skipped(MigrationStep::PermissionJob.as_str(), "already created"));
        } else {
            let job = self.create_permission_job().await?;
            self.ledger.record(MigrationStep::PermissionJob).await?;
            reports.push(StepReport::done(MigrationStep::PermissionJob.as_str(), job));
        }
        Ok(reports)
    }

    async fn scale_down(&self) -> Result<()> {
        let name = self.names.prometheus_deployment();
        let mut deployment = self
            .cluster
            .get_deployment(self.namespace, &name)
            .await
            .step("read prometheus deployment")?
            .ok_or_else(|| UpgradeError::NotFound { kind: "deployment", name: name.clone() })?;
        deployment.spec.get_or_insert_with(Default::default).replicas = Some(0);
        // Status is server-owned and rejected on replace with a stale view.
        deployment.status = None;
        self.cluster.update_deployment(self.namespace, &deployment).await.step("scale down prometheus")?;
        info!(deployment = %name, "scaled to zero");
        Ok(())
    }

    async fn wait_for_drain(&self) -> Result<u32> {
        let selector = self.names.prometheus_pod_selector();
        let res = poll_until(&self.policy, &self.cancel, |attempt| {
            let selector = selector.clone();
            async move {
                let pods = self.cluster.list_pods(self.namespace, &selector).await?;
                if !pods.is_empty() {
                    info!(attempt, remaining = pods.len(), "waiting for prometheus pods to terminate");
                }
                Ok(pods.is_empty())
            }
        })
        .await;
        match res {
            Ok(checks) => Ok(checks),
            Err(PollError::Exhausted(attempts)) => Err(UpgradeError::DrainTimeout { selector, attempts }),
            Err(PollError::DeadlineExceeded { deadline, checks }) => {
                warn!(deadline_secs = deadline.as_secs(), checks, "drain deadline exceeded");
                Err(UpgradeError::DrainTimeout { selector, attempts: checks })
            }
            Err(PollError::Cancelled) => Err(UpgradeError::Cancelled("waiting for prometheus pods to terminate")),
            Err(PollError::Check(e)) => Err(UpgradeError::Step { step: "list prometheus pods", source: e }),
        }
    }

    async fn rebind_volume(&self) -> Result<VolumeBinding> {
        let old_name = self.names.legacy_prometheus_pvc();
        let old = self
            .cluster
            .get_pvc(self.namespace, &old_name)
            .await
            .step("read prometheus pvc")?
            .ok_or_else(|| UpgradeError::NotFound { kind: "pvc", name: old_name.clone() })?;
        let binding = binding_of(&old)?;

        let mut pv = self
            .cluster
            .get_pv(&binding.pv_name)
            .await
            .step("read prometheus pv")?
            .ok_or_else(|| UpgradeError::NotFound { kind: "pv", name: binding.pv_name.clone() })?;
        if let Some(spec) = pv.spec.as_mut() {
            spec.claim_ref = None;
        }
        pv.status = None;
        self.cluster.update_pv(&pv).await.step("detach prometheus pv")?;
        info!(pv = %binding.pv_name, claim = %old_name, "claim reference cleared");

        let new_name = self.names.prometheus_pvc();
        let claim = rebound_claim(&binding, &new_name);
        self.cluster.create_pvc(self.namespace, &claim).await.step("create rebound pvc")?;
        info!(pvc = %new_name, pv = %binding.pv_name, "volume bound to new claim");
        Ok(binding)
    }

    async fn create_permission_job(&self) -> Result<String> {
        let job = PermissionFixJob::for_prometheus(self.names);
        self.cluster.create_job(self.namespace, &job.to_job()).await.step("create permission fix job")?;
        info!(job = %job.name, pvc = %job.pvc_name, "permission fix job created");
        Ok(job.name)
    }
}
