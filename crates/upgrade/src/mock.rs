//! In-memory collaborators for tests.
//!
//! Every mock writes `"<operation> <object>"` into a shared [`CallLog`] so
//! tests can assert on the global order of cluster, chart and manifest calls.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec},
    batch::v1::Job,
    core::v1::{
        ConfigMap, ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
        PersistentVolumeSpec, Pod, Secret, VolumeResourceRequirements,
    },
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use obs_apply::ManifestSource;
use obs_core::{ChartMetadata, DeployedRelease};
use obs_helm::{ChartApplySpec, ChartService, ReleaseResult};
use obs_kubehub::ClusterService;
use serde_json::Value as Json;

use crate::names::ResourceNames;
use crate::orchestrator::Confirm;

/// Operations that change cluster or release state.
const MUTATING: [&str; 5] = ["create_", "update_", "delete_", "apply_", "install_"];

#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) { self.0.lock().unwrap().push(entry.into()); }

    pub fn entries(&self) -> Vec<String> { self.0.lock().unwrap().clone() }

    /// Index of the first entry starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|e| e.starts_with(prefix))
    }

    /// Index of the last entry starting with `prefix`.
    pub fn last_position(&self, prefix: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().rposition(|e| e.starts_with(prefix))
    }

    pub fn mutations(&self) -> Vec<String> {
        self.entries().into_iter().filter(|e| MUTATING.iter().any(|m| e.starts_with(m))).collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

#[derive(Default)]
struct ClusterState {
    secrets: BTreeMap<String, Secret>,
    jobs: BTreeMap<String, Job>,
    daemonsets: BTreeSet<String>,
    services: BTreeSet<String>,
    deployments: BTreeMap<String, Deployment>,
    pods: Vec<Pod>,
    pvcs: BTreeMap<String, PersistentVolumeClaim>,
    pvs: BTreeMap<String, PersistentVolume>,
    config_maps: BTreeMap<String, ConfigMap>,
    manifests: Vec<Vec<u8>>,
    fail: HashSet<String>,
    /// Pod lists after scale-down that still report pods; `None` never drains.
    drain_after: Option<u32>,
    lists_since_scale_down: u32,
    scaled_down: bool,
}

/// Single-namespace fake cluster.
pub struct MockCluster {
    log: CallLog,
    state: Mutex<ClusterState>,
}

impl MockCluster {
    pub fn new(log: CallLog) -> Self {
        let state = ClusterState { drain_after: Some(1), ..Default::default() };
        Self { log, state: Mutex::new(state) }
    }

    pub fn with_secret(self, secret: Secret) -> Self {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().secrets.insert(name, secret);
        self
    }

    pub fn with_job(self, job: Job) -> Self {
        let name = job.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().jobs.insert(name, job);
        self
    }

    pub fn with_daemonset(self, name: &str) -> Self {
        self.state.lock().unwrap().daemonsets.insert(name.to_string());
        self
    }

    pub fn with_service(self, name: &str) -> Self {
        self.state.lock().unwrap().services.insert(name.to_string());
        self
    }

    pub fn with_deployment(self, deployment: Deployment) -> Self {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().deployments.insert(name, deployment);
        self
    }

    pub fn with_pod(self, pod: Pod) -> Self {
        self.state.lock().unwrap().pods.push(pod);
        self
    }

    pub fn with_pvc(self, pvc: PersistentVolumeClaim) -> Self {
        let name = pvc.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().pvcs.insert(name, pvc);
        self
    }

    pub fn with_pv(self, pv: PersistentVolume) -> Self {
        let name = pv.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().pvs.insert(name, pv);
        self
    }

    /// Pods stay listed for `lists` polls after scale-down; `None` keeps them forever.
    pub fn drain_after(self, lists: Option<u32>) -> Self {
        self.state.lock().unwrap().drain_after = lists;
        self
    }

    /// Make the call logged as `entry` (e.g. `"create_secret tobs-certificate"`) fail.
    pub fn fail_on(&self, entry: &str) { self.state.lock().unwrap().fail.insert(entry.to_string()); }

    pub fn clear_failures(&self) { self.state.lock().unwrap().fail.clear(); }

    pub fn secret(&self, name: &str) -> Option<Secret> { self.state.lock().unwrap().secrets.get(name).cloned() }
    pub fn job(&self, name: &str) -> Option<Job> { self.state.lock().unwrap().jobs.get(name).cloned() }
    pub fn deployment(&self, name: &str) -> Option<Deployment> { self.state.lock().unwrap().deployments.get(name).cloned() }
    pub fn pvc(&self, name: &str) -> Option<PersistentVolumeClaim> { self.state.lock().unwrap().pvcs.get(name).cloned() }
    pub fn pv(&self, name: &str) -> Option<PersistentVolume> { self.state.lock().unwrap().pvs.get(name).cloned() }
    pub fn config_map(&self, name: &str) -> Option<ConfigMap> { self.state.lock().unwrap().config_maps.get(name).cloned() }
    pub fn has_daemonset(&self, name: &str) -> bool { self.state.lock().unwrap().daemonsets.contains(name) }
    pub fn has_service(&self, name: &str) -> bool { self.state.lock().unwrap().services.contains(name) }
    pub fn applied_manifests(&self) -> Vec<Vec<u8>> { self.state.lock().unwrap().manifests.clone() }

    fn enter(&self, op: &str, name: &str) -> Result<std::sync::MutexGuard<'_, ClusterState>> {
        let entry = format!("{} {}", op, name);
        self.log.push(entry.clone());
        let st = self.state.lock().unwrap();
        if st.fail.contains(&entry) {
            return Err(anyhow!("injected failure: {}", entry));
        }
        Ok(st)
    }
}

fn name_of(meta: &ObjectMeta) -> Result<String> {
    meta.name.clone().ok_or_else(|| anyhow!("object is missing metadata.name"))
}

fn insert_new<T: Clone>(map: &mut BTreeMap<String, T>, kind: &str, name: String, obj: &T) -> Result<T> {
    if map.contains_key(&name) {
        return Err(anyhow!("{} {} already exists", kind, name));
    }
    map.insert(name, obj.clone());
    Ok(obj.clone())
}

fn selector_matches(selector: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    selector.split(',').filter(|s| !s.is_empty()).all(|term| match term.split_once('=') {
        Some((k, v)) => labels.and_then(|l| l.get(k)).map(|x| x == v).unwrap_or(false),
        None => false,
    })
}

#[async_trait::async_trait]
impl ClusterService for MockCluster {
    async fn get_secret(&self, _ns: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.enter("get_secret", name)?.secrets.get(name).cloned())
    }

    async fn create_secret(&self, _ns: &str, secret: &Secret) -> Result<Secret> {
        let name = name_of(&secret.metadata)?;
        let mut st = self.enter("create_secret", &name)?;
        insert_new(&mut st.secrets, "secret", name, secret)
    }

    async fn get_job(&self, _ns: &str, name: &str) -> Result<Option<Job>> {
        Ok(self.enter("get_job", name)?.jobs.get(name).cloned())
    }

    async fn create_job(&self, _ns: &str, job: &Job) -> Result<Job> {
        let name = name_of(&job.metadata)?;
        let mut st = self.enter("create_job", &name)?;
        insert_new(&mut st.jobs, "job", name, job)
    }

    async fn delete_job(&self, _ns: &str, name: &str) -> Result<bool> {
        Ok(self.enter("delete_job", name)?.jobs.remove(name).is_some())
    }

    async fn delete_daemonset(&self, _ns: &str, name: &str) -> Result<bool> {
        Ok(self.enter("delete_daemonset", name)?.daemonsets.remove(name))
    }

    async fn delete_service(&self, _ns: &str, name: &str) -> Result<bool> {
        Ok(self.enter("delete_service", name)?.services.remove(name))
    }

    async fn get_deployment(&self, _ns: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.enter("get_deployment", name)?.deployments.get(name).cloned())
    }

    async fn update_deployment(&self, _ns: &str, deployment: &Deployment) -> Result<Deployment> {
        let name = name_of(&deployment.metadata)?;
        let mut st = self.enter("update_deployment", &name)?;
        if !st.deployments.contains_key(&name) {
            return Err(anyhow!("deployment {} not found", name));
        }
        if deployment.spec.as_ref().and_then(|s| s.replicas) == Some(0) && !st.scaled_down {
            st.scaled_down = true;
            st.lists_since_scale_down = 0;
        }
        st.deployments.insert(name, deployment.clone());
        Ok(deployment.clone())
    }

    async fn list_pods(&self, _ns: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let mut st = self.enter("list_pods", label_selector)?;
        if st.scaled_down {
            st.lists_since_scale_down += 1;
            if let Some(n) = st.drain_after {
                if st.lists_since_scale_down > n {
                    st.pods.clear();
                }
            }
        }
        Ok(st.pods.iter().filter(|p| selector_matches(label_selector, p.metadata.labels.as_ref())).cloned().collect())
    }

    async fn get_pvc(&self, _ns: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.enter("get_pvc", name)?.pvcs.get(name).cloned())
    }

    async fn create_pvc(&self, _ns: &str, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let name = name_of(&pvc.metadata)?;
        let mut st = self.enter("create_pvc", &name)?;
        insert_new(&mut st.pvcs, "pvc", name, pvc)
    }

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.enter("get_pv", name)?.pvs.get(name).cloned())
    }

    async fn update_pv(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        let name = name_of(&pv.metadata)?;
        let mut st = self.enter("update_pv", &name)?;
        if !st.pvs.contains_key(&name) {
            return Err(anyhow!("pv {} not found", name));
        }
        st.pvs.insert(name, pv.clone());
        Ok(pv.clone())
    }

    async fn apply_raw_manifest(&self, manifest: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(manifest);
        let first = text.lines().next().unwrap_or("").to_string();
        let mut st = self.enter("apply_raw_manifest", &first)?;
        st.manifests.push(manifest.to_vec());
        Ok(())
    }

    async fn get_config_map(&self, _ns: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.enter("get_config_map", name)?.config_maps.get(name).cloned())
    }

    async fn create_config_map(&self, _ns: &str, cm: &ConfigMap) -> Result<ConfigMap> {
        let name = name_of(&cm.metadata)?;
        let mut st = self.enter("create_config_map", &name)?;
        insert_new(&mut st.config_maps, "configmap", name, cm)
    }
}

/// Fake chart service holding at most one release.
pub struct MockCharts {
    log: CallLog,
    release: Mutex<Option<DeployedRelease>>,
    latest: ChartMetadata,
    target_values: Json,
    applied: Mutex<Vec<ChartApplySpec>>,
    fail_apply: Mutex<bool>,
}

impl MockCharts {
    pub fn new(log: CallLog, release: Option<DeployedRelease>, latest_version: &str, target_values: Json) -> Self {
        Self {
            log,
            release: Mutex::new(release),
            latest: ChartMetadata { name: "tobs".into(), version: latest_version.into(), app_version: None },
            target_values,
            applied: Mutex::new(Vec::new()),
            fail_apply: Mutex::new(false),
        }
    }

    pub fn applied(&self) -> Vec<ChartApplySpec> { self.applied.lock().unwrap().clone() }

    pub fn release(&self) -> Option<DeployedRelease> { self.release.lock().unwrap().clone() }

    pub fn fail_apply(&self, fail: bool) { *self.fail_apply.lock().unwrap() = fail; }

    fn record(&self, spec: &ChartApplySpec) -> ReleaseResult {
        self.applied.lock().unwrap().push(spec.clone());
        let version = spec.version.clone().unwrap_or_else(|| self.latest.version.clone());
        *self.release.lock().unwrap() = Some(DeployedRelease {
            release_name: spec.release_name.clone(),
            namespace: spec.namespace.clone(),
            chart_name: self.latest.name.clone(),
            chart_version: version.clone(),
            computed_values: self.target_values.clone(),
        });
        ReleaseResult {
            name: spec.release_name.clone(),
            namespace: spec.namespace.clone(),
            revision: self.applied.lock().unwrap().len() as u64,
            chart_version: version,
            status: "deployed".into(),
        }
    }
}

#[async_trait::async_trait]
impl ChartService for MockCharts {
    async fn deployed_release(&self, release: &str, _ns: &str) -> Result<Option<DeployedRelease>> {
        self.log.push(format!("deployed_release {}", release));
        Ok(self.release.lock().unwrap().clone().filter(|r| r.release_name == release))
    }

    async fn chart_metadata(&self, chart_ref: &str, _version: Option<&str>) -> Result<ChartMetadata> {
        self.log.push(format!("chart_metadata {}", chart_ref));
        Ok(self.latest.clone())
    }

    async fn values_for_chart(&self, chart_ref: &str, _version: Option<&str>, _overrides: Option<&Path>) -> Result<Json> {
        self.log.push(format!("values_for_chart {}", chart_ref));
        Ok(self.target_values.clone())
    }

    async fn add_or_refresh_repo(&self, name: &str, _url: &str) -> Result<()> {
        self.log.push(format!("add_or_refresh_repo {}", name));
        Ok(())
    }

    async fn apply_chart(&self, spec: &ChartApplySpec) -> Result<ReleaseResult> {
        self.log.push(format!("apply_chart {}", spec.release_name));
        if *self.fail_apply.lock().unwrap() {
            return Err(anyhow!("injected chart apply failure"));
        }
        Ok(self.record(spec))
    }

    async fn install_chart(&self, spec: &ChartApplySpec) -> Result<ReleaseResult> {
        self.log.push(format!("install_chart {}", spec.release_name));
        Ok(self.record(spec))
    }
}

/// Serves manifest bodies from memory.
pub struct MockManifests {
    log: CallLog,
    bodies: HashMap<String, Bytes>,
}

impl MockManifests {
    pub fn new(log: CallLog) -> Self { Self { log, bodies: HashMap::new() } }

    pub fn serve(mut self, url: &str, body: &str) -> Self {
        self.bodies.insert(url.to_string(), Bytes::from(body.to_string()));
        self
    }
}

#[async_trait::async_trait]
impl ManifestSource for MockManifests {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        self.log.push(format!("fetch {}", url));
        self.bodies.get(url).cloned().ok_or_else(|| anyhow!("fetching {}: HTTP 404 Not Found", url))
    }
}

/// Confirmation with a fixed answer.
pub struct ScriptedConfirm {
    answer: bool,
    asked: AtomicUsize,
}

impl ScriptedConfirm {
    pub fn new(answer: bool) -> Self { Self { answer, asked: AtomicUsize::new(0) } }
    pub fn asked(&self) -> usize { self.asked.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl Confirm for ScriptedConfirm {
    async fn confirm(&self, _prompt: &str) -> Result<bool> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer)
    }
}

// ----------------- fixtures -----------------

pub fn release(name: &str, ns: &str, version: &str, values: Json) -> DeployedRelease {
    DeployedRelease {
        release_name: name.into(),
        namespace: ns.into(),
        chart_name: "tobs".into(),
        chart_version: version.into(),
        computed_values: values,
    }
}

pub fn secret(name: &str, data: &[(&str, &[u8])]) -> Secret {
    Secret {
        metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
        data: Some(data.iter().map(|(k, v)| (k.to_string(), ByteString(v.to_vec()))).collect()),
        ..Default::default()
    }
}

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Legacy Prometheus deployment, one running pod and its bound storage.
pub fn with_legacy_prometheus(cluster: MockCluster, names: &ResourceNames, pv_name: &str) -> MockCluster {
    let pod_labels = labels(&[("app", "prometheus"), ("component", "server"), ("release", names.release())]);
    let deployment = Deployment {
        metadata: ObjectMeta { name: Some(names.prometheus_deployment()), ..Default::default() },
        spec: Some(DeploymentSpec { replicas: Some(1), ..Default::default() }),
        ..Default::default()
    };
    let pod = Pod {
        metadata: ObjectMeta {
            name: Some(format!("{}-7f9c", names.prometheus_deployment())),
            labels: Some(pod_labels),
            ..Default::default()
        },
        ..Default::default()
    };
    let pvc = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(names.legacy_prometheus_pvc()),
            labels: Some(labels(&[("app", "prometheus"), ("release", names.release())])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity("8Gi".into()))])),
                ..Default::default()
            }),
            volume_mode: Some("Filesystem".into()),
            volume_name: Some(pv_name.into()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let pv = PersistentVolume {
        metadata: ObjectMeta { name: Some(pv_name.into()), ..Default::default() },
        spec: Some(PersistentVolumeSpec {
            claim_ref: Some(ObjectReference {
                kind: Some("PersistentVolumeClaim".into()),
                name: Some(names.legacy_prometheus_pvc()),
                uid: Some("2c1f3a52-legacy".into()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    cluster.with_deployment(deployment).with_pod(pod).with_pvc(pvc).with_pv(pv)
}
