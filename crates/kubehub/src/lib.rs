//! obsctl kubehub: the cluster operations the upgrade flow relies on, behind a
//! trait so the orchestrator can run against a real cluster or a recording fake.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment},
    batch::v1::Job,
    core::v1::{ConfigMap, PersistentVolume, PersistentVolumeClaim, Pod, Secret, Service},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    Client,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

/// Cluster-side collaborator of the upgrade flow.
///
/// Getters return `None` for missing objects; deletes return `false` when the
/// object was already gone. Every other API failure is an error.
#[async_trait::async_trait]
pub trait ClusterService: Send + Sync {
    async fn get_secret(&self, ns: &str, name: &str) -> Result<Option<Secret>>;
    async fn create_secret(&self, ns: &str, secret: &Secret) -> Result<Secret>;

    async fn get_job(&self, ns: &str, name: &str) -> Result<Option<Job>>;
    async fn create_job(&self, ns: &str, job: &Job) -> Result<Job>;
    async fn delete_job(&self, ns: &str, name: &str) -> Result<bool>;

    async fn delete_daemonset(&self, ns: &str, name: &str) -> Result<bool>;
    async fn delete_service(&self, ns: &str, name: &str) -> Result<bool>;

    async fn get_deployment(&self, ns: &str, name: &str) -> Result<Option<Deployment>>;
    async fn update_deployment(&self, ns: &str, deployment: &Deployment) -> Result<Deployment>;

    async fn list_pods(&self, ns: &str, label_selector: &str) -> Result<Vec<Pod>>;

    async fn get_pvc(&self, ns: &str, name: &str) -> Result<Option<PersistentVolumeClaim>>;
    async fn create_pvc(&self, ns: &str, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;
    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>>;
    async fn update_pv(&self, pv: &PersistentVolume) -> Result<PersistentVolume>;

    /// Server-side apply a raw (possibly multi-document) manifest.
    async fn apply_raw_manifest(&self, manifest: &[u8]) -> Result<()>;

    async fn get_config_map(&self, ns: &str, name: &str) -> Result<Option<ConfigMap>>;
    async fn create_config_map(&self, ns: &str, cm: &ConfigMap) -> Result<ConfigMap>;
}

/// `true` for a 404 from the API server.
pub fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

fn object_name<'a>(meta: &'a ObjectMeta, kind: &str) -> Result<&'a str> {
    meta.name.as_deref().ok_or_else(|| anyhow!("{} is missing metadata.name", kind))
}

async fn get_opt<K>(api: &Api<K>, kind: &str, name: &str) -> Result<Option<K>>
where
    K: Clone + DeserializeOwned + Debug,
{
    api.get_opt(name).await.with_context(|| format!("getting {} {}", kind, name))
}

async fn delete_opt<K>(api: &Api<K>, kind: &str, name: &str) -> Result<bool>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => {
            counter!("kube_deletes", 1u64);
            info!(kind, name, "deleted");
            Ok(true)
        }
        Err(e) if is_not_found(&e) => {
            debug!(kind, name, "already absent");
            Ok(false)
        }
        Err(e) => Err(anyhow!(e).context(format!("deleting {} {}", kind, name))),
    }
}

/// [`ClusterService`] on top of a kube-rs client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Connect using the ambient kubeconfig / in-cluster config.
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self { Self { client } }

    pub fn client(&self) -> &Client { &self.client }

    /// Namespace of the current kube context.
    pub fn default_namespace(&self) -> &str { self.client.default_namespace() }
}

#[async_trait::async_trait]
impl ClusterService for KubeCluster {
    async fn get_secret(&self, ns: &str, name: &str) -> Result<Option<Secret>> {
        get_opt(&Api::<Secret>::namespaced(self.client.clone(), ns), "secret", name).await
    }

    async fn create_secret(&self, ns: &str, secret: &Secret) -> Result<Secret> {
        let name = object_name(&secret.metadata, "secret")?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), ns);
        api.create(&PostParams::default(), secret).await.with_context(|| format!("creating secret {}", name))
    }

    async fn get_job(&self, ns: &str, name: &str) -> Result<Option<Job>> {
        get_opt(&Api::<Job>::namespaced(self.client.clone(), ns), "job", name).await
    }

    async fn create_job(&self, ns: &str, job: &Job) -> Result<Job> {
        let name = object_name(&job.metadata, "job")?;
        let api: Api<Job> = Api::namespaced(self.client.clone(), ns);
        api.create(&PostParams::default(), job).await.with_context(|| format!("creating job {}", name))
    }

    async fn delete_job(&self, ns: &str, name: &str) -> Result<bool> {
        delete_opt(&Api::<Job>::namespaced(self.client.clone(), ns), "job", name).await
    }

    async fn delete_daemonset(&self, ns: &str, name: &str) -> Result<bool> {
        delete_opt(&Api::<DaemonSet>::namespaced(self.client.clone(), ns), "daemonset", name).await
    }

    async fn delete_service(&self, ns: &str, name: &str) -> Result<bool> {
        delete_opt(&Api::<Service>::namespaced(self.client.clone(), ns), "service", name).await
    }

    async fn get_deployment(&self, ns: &str, name: &str) -> Result<Option<Deployment>> {
        get_opt(&Api::<Deployment>::namespaced(self.client.clone(), ns), "deployment", name).await
    }

    async fn update_deployment(&self, ns: &str, deployment: &Deployment) -> Result<Deployment> {
        let name = object_name(&deployment.metadata, "deployment")?;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
        api.replace(name, &PostParams::default(), deployment).await.with_context(|| format!("updating deployment {}", name))
    }

    async fn list_pods(&self, ns: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let lp = ListParams::default().labels(label_selector);
        let pods = api.list(&lp).await.with_context(|| format!("listing pods ({})", label_selector))?;
        Ok(pods.items)
    }

    async fn get_pvc(&self, ns: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        get_opt(&Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), ns), "pvc", name).await
    }

    async fn create_pvc(&self, ns: &str, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let name = object_name(&pvc.metadata, "pvc")?;
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), ns);
        api.create(&PostParams::default(), pvc).await.with_context(|| format!("creating pvc {}", name))
    }

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>> {
        get_opt(&Api::<PersistentVolume>::all(self.client.clone()), "pv", name).await
    }

    async fn update_pv(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        let name = object_name(&pv.metadata, "pv")?;
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.replace(name, &PostParams::default(), pv).await.with_context(|| format!("updating pv {}", name))
    }

    async fn apply_raw_manifest(&self, manifest: &[u8]) -> Result<()> {
        let res = obs_apply::apply_manifest(self.client.clone(), manifest).await?;
        debug!(applied = ?res.applied, "raw manifest applied");
        Ok(())
    }

    async fn get_config_map(&self, ns: &str, name: &str) -> Result<Option<ConfigMap>> {
        get_opt(&Api::<ConfigMap>::namespaced(self.client.clone(), ns), "configmap", name).await
    }

    async fn create_config_map(&self, ns: &str, cm: &ConfigMap) -> Result<ConfigMap> {
        let name = object_name(&cm.metadata, "configmap")?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), ns);
        api.create(&PostParams::default(), cm).await.with_context(|| format!("creating configmap {}", name))
    }
}
