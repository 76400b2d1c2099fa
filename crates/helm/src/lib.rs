//! obsctl chart service.
//!
//! [`ChartService`] is everything the upgrade flow needs from the chart side:
//! reading the deployed release, resolving the target chart and its values,
//! refreshing the repository index and finally installing or upgrading.
//! [`HelmCli`] implements it by driving the `helm` binary.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use metrics::counter;
use obs_core::{ChartMetadata, DeployedRelease};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

/// Repository the published chart lives in.
pub const DEFAULT_REPO_NAME: &str = "timescale";
pub const DEFAULT_REPO_URL: &str = "https://charts.timescale.com";
/// Chart reference used when the caller does not name one.
pub const DEFAULT_CHART_REFERENCE: &str = "timescale/tobs";

/// Everything needed for `helm install` / `helm upgrade`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChartApplySpec {
    pub release_name: String,
    pub namespace: String,
    pub chart_reference: String,
    pub version: Option<String>,
    pub values_file: Option<PathBuf>,
    pub reset_values: bool,
    pub reuse_values: bool,
    /// Wait for workloads to become ready, bounded by this duration.
    pub timeout: Option<Duration>,
}

/// Outcome of an install/upgrade as reported by the chart tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseResult {
    pub name: String,
    pub namespace: String,
    pub revision: u64,
    pub chart_version: String,
    pub status: String,
}

#[async_trait::async_trait]
pub trait ChartService: Send + Sync {
    /// The deployed release with its computed values, `None` if not installed.
    async fn deployed_release(&self, release: &str, ns: &str) -> Result<Option<DeployedRelease>>;
    async fn chart_metadata(&self, chart_ref: &str, version: Option<&str>) -> Result<ChartMetadata>;
    /// Chart defaults overlaid with the caller's override file.
    async fn values_for_chart(&self, chart_ref: &str, version: Option<&str>, overrides: Option<&Path>) -> Result<Json>;
    async fn add_or_refresh_repo(&self, name: &str, url: &str) -> Result<()>;
    async fn apply_chart(&self, spec: &ChartApplySpec) -> Result<ReleaseResult>;
    async fn install_chart(&self, spec: &ChartApplySpec) -> Result<ReleaseResult>;
}

/// Deep-merge `overlay` into `base` the way chart values are coalesced:
/// maps merge key by key, anything else replaces, `null` removes the key.
pub fn merge_values(base: &mut Json, overlay: Json) {
    match (base, overlay) {
        (Json::Object(b), Json::Object(o)) => {
            for (k, v) in o {
                if v.is_null() {
                    b.remove(&k);
                    continue;
                }
                let both_maps = v.is_object() && b.get(&k).map_or(false, Json::is_object);
                if both_maps {
                    if let Some(existing) = b.get_mut(&k) { merge_values(existing, v); }
                } else {
                    b.insert(k, v);
                }
            }
        }
        (b, o) => *b = o,
    }
}

fn yaml_to_json(text: &str, what: &str) -> Result<Json> {
    let val: serde_yaml::Value = serde_yaml::from_str(text).with_context(|| format!("parsing {} YAML", what))?;
    let json = serde_json::to_value(val).with_context(|| format!("converting {} to JSON", what))?;
    Ok(if json.is_null() { Json::Object(Default::default()) } else { json })
}

/// Split a `helm list` chart label (`tobs-0.5.0`) into name and version.
/// The version starts at the right-most `-` followed by a digit.
pub fn split_chart_label(label: &str) -> Option<(&str, &str)> {
    label
        .match_indices('-')
        .map(|(i, _)| i)
        .filter(|&i| label[i + 1..].starts_with(|c: char| c.is_ascii_digit()))
        .last()
        .map(|i| (&label[..i], &label[i + 1..]))
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    name: String,
    namespace: String,
    chart: String,
}

#[derive(Debug, Deserialize)]
struct ReleaseJson {
    name: String,
    namespace: String,
    #[serde(default)]
    version: u64,
    #[serde(default)]
    info: Option<ReleaseInfo>,
    #[serde(default)]
    chart: Option<ReleaseChart>,
}

#[derive(Debug, Deserialize)]
struct ReleaseInfo { #[serde(default)] status: String }

#[derive(Debug, Deserialize)]
struct ReleaseChart { metadata: ChartMetadata }

fn parse_release_json(out: &str) -> Result<ReleaseResult> {
    let r: ReleaseJson = serde_json::from_str(out).context("parsing helm release JSON")?;
    Ok(ReleaseResult {
        name: r.name,
        namespace: r.namespace,
        revision: r.version,
        chart_version: r.chart.map(|c| c.metadata.version).unwrap_or_default(),
        status: r.info.map(|i| i.status).unwrap_or_default(),
    })
}

/// Arguments for `helm upgrade` (or `helm install` when `install`).
pub fn apply_args(spec: &ChartApplySpec, install: bool) -> Vec<String> {
    let mut args: Vec<String> = vec![
        if install { "install" } else { "upgrade" }.into(),
        spec.release_name.clone(),
        spec.chart_reference.clone(),
        "--namespace".into(),
        spec.namespace.clone(),
        "--output".into(),
        "json".into(),
    ];
    if install { args.push("--create-namespace".into()); }
    if let Some(v) = &spec.version { args.extend(["--version".into(), v.clone()]); }
    if let Some(f) = &spec.values_file { args.extend(["--values".into(), f.display().to_string()]); }
    if !install {
        if spec.reset_values { args.push("--reset-values".into()); }
        if spec.reuse_values { args.push("--reuse-values".into()); }
    }
    if let Some(t) = spec.timeout {
        args.extend(["--wait".into(), "--timeout".into(), format!("{}s", t.as_secs())]);
    }
    args
}

/// [`ChartService`] backed by the `helm` binary (`OBS_HELM_BIN`, default `helm`).
pub struct HelmCli {
    bin: String,
}

impl HelmCli {
    pub fn new() -> Self {
        Self { bin: std::env::var("OBS_HELM_BIN").unwrap_or_else(|_| "helm".to_string()) }
    }

    pub fn with_binary(bin: impl Into<String>) -> Self { Self { bin: bin.into() } }

    async fn run(&self, args: &[String]) -> Result<String> {
        counter!("helm_invocations", 1u64);
        debug!(bin = %self.bin, args = ?args, "helm");
        let out = tokio::process::Command::new(&self.bin)
            .args(args)
            .output()
            .await
            .with_context(|| format!("spawning {}", self.bin))?;
        if !out.status.success() {
            counter!("helm_failures", 1u64);
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(anyhow!("helm {} failed ({}): {}", args.first().map(String::as_str).unwrap_or(""), out.status, stderr.trim()));
        }
        String::from_utf8(out.stdout).context("helm output is not valid UTF-8")
    }

    fn version_args(args: &mut Vec<String>, version: Option<&str>) {
        if let Some(v) = version { args.extend(["--version".into(), v.to_string()]); }
    }
}

impl Default for HelmCli {
    fn default() -> Self { Self::new() }
}

#[async_trait::async_trait]
impl ChartService for HelmCli {
    async fn deployed_release(&self, release: &str, ns: &str) -> Result<Option<DeployedRelease>> {
        let args: Vec<String> = vec![
            "list".into(), "--namespace".into(), ns.into(),
            "--filter".into(), format!("^{}$", release),
            "--output".into(), "json".into(),
        ];
        let out = self.run(&args).await?;
        let entries: Vec<ListEntry> = serde_json::from_str(&out).context("parsing helm list output")?;
        let Some(entry) = entries.into_iter().find(|e| e.name == release) else {
            return Ok(None);
        };
        let (chart_name, chart_version) = split_chart_label(&entry.chart)
            .ok_or_else(|| anyhow!("cannot split chart label {:?} into name and version", entry.chart))?;
        let (chart_name, chart_version) = (chart_name.to_string(), chart_version.to_string());

        let args: Vec<String> = vec![
            "get".into(), "values".into(), release.into(),
            "--namespace".into(), ns.into(), "--all".into(),
            "--output".into(), "json".into(),
        ];
        let values_out = self.run(&args).await?;
        let computed_values: Json = serde_json::from_str(&values_out).context("parsing release values")?;
        Ok(Some(DeployedRelease {
            release_name: entry.name,
            namespace: entry.namespace,
            chart_name,
            chart_version,
            computed_values: if computed_values.is_null() { Json::Object(Default::default()) } else { computed_values },
        }))
    }

    async fn chart_metadata(&self, chart_ref: &str, version: Option<&str>) -> Result<ChartMetadata> {
        let mut args: Vec<String> = vec!["show".into(), "chart".into(), chart_ref.into()];
        Self::version_args(&mut args, version);
        let out = self.run(&args).await?;
        serde_yaml::from_str(&out).with_context(|| format!("parsing Chart.yaml of {}", chart_ref))
    }

    async fn values_for_chart(&self, chart_ref: &str, version: Option<&str>, overrides: Option<&Path>) -> Result<Json> {
        let mut args: Vec<String> = vec!["show".into(), "values".into(), chart_ref.into()];
        Self::version_args(&mut args, version);
        let out = self.run(&args).await?;
        let mut values = yaml_to_json(&out, "chart values")?;
        if let Some(path) = overrides {
            let text = tokio::fs::read_to_string(path).await.with_context(|| format!("reading {}", path.display()))?;
            merge_values(&mut values, yaml_to_json(&text, "override values")?);
        }
        Ok(values)
    }

    async fn add_or_refresh_repo(&self, name: &str, url: &str) -> Result<()> {
        let add: Vec<String> = vec!["repo".into(), "add".into(), name.into(), url.into(), "--force-update".into()];
        self.run(&add).await?;
        let update: Vec<String> = vec!["repo".into(), "update".into(), name.into()];
        self.run(&update).await?;
        info!(repo = %name, url = %url, "chart repository refreshed");
        Ok(())
    }

    async fn apply_chart(&self, spec: &ChartApplySpec) -> Result<ReleaseResult> {
        let out = self.run(&apply_args(spec, false)).await?;
        parse_release_json(&out)
    }

    async fn install_chart(&self, spec: &ChartApplySpec) -> Result<ReleaseResult> {
        let out = self.run(&apply_args(spec, true)).await?;
        parse_release_json(&out)
    }
}
