//! obsctl apply: raw manifest parsing and server-side apply, plus the CRD
//! manifest set consumed by the upgrade reconciler.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use kube::{api::{Api, Patch, PatchParams}, core::{DynamicObject, GroupVersionKind}, discovery::{Discovery, Scope}, Client};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

pub mod manifests;

pub use manifests::{CrdManifest, CrdManifestSet, HttpManifestSource, ManifestSource};

/// Field manager used for every server-side apply issued by obsctl.
pub const FIELD_MANAGER: &str = "obsctl";

fn max_manifest_bytes() -> usize {
    std::env::var("OBS_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(8 * 1024 * 1024) // CRDs with full OpenAPI schemas run to several MiB
}

fn max_manifest_nodes() -> usize {
    std::env::var("OBS_MAX_MANIFEST_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(2_000_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for (_k, vv) in map.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Object addressed by a manifest document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestTarget {
    pub gvk: GroupVersionKind,
    pub name: String,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyResult {
    /// `kind/name` of every object applied, in document order.
    pub applied: Vec<String>,
}

/// Split a (possibly multi-document) YAML manifest into JSON objects.
/// Empty documents (`---` separators, comments only) are dropped.
pub fn parse_manifest(bytes: &[u8]) -> Result<Vec<Json>> {
    if bytes.len() > max_manifest_bytes() {
        return Err(anyhow!("manifest too large (>{} bytes)", max_manifest_bytes()));
    }
    let text = std::str::from_utf8(bytes).context("manifest is not valid UTF-8")?;
    let mut docs = Vec::new();
    for de in serde_yaml::Deserializer::from_str(text) {
        let val = serde_yaml::Value::deserialize(de).context("parsing YAML")?;
        if val.is_null() { continue; }
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        if json_node_budget_exceeded(&json, max_manifest_nodes()) {
            return Err(anyhow!("manifest document too complex (>{} nodes)", max_manifest_nodes()));
        }
        docs.push(json);
    }
    if docs.is_empty() {
        return Err(anyhow!("manifest contains no objects"));
    }
    Ok(docs)
}

pub fn target_of(json: &Json) -> Result<ManifestTarget> {
    let api_version_s = json.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("manifest missing apiVersion"))?.to_string();
    let kind_s = json.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("manifest missing kind"))?.to_string();
    let (group, version) = if let Some((g, v)) = api_version_s.split_once('/') { (g.to_string(), v.to_string()) } else { (String::new(), api_version_s) };
    let name = json.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()).ok_or_else(|| anyhow!("manifest missing metadata.name"))?.to_string();
    let namespace = json.get("metadata").and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).map(|s| s.to_string());
    Ok(ManifestTarget { gvk: GroupVersionKind { group, version, kind: kind_s }, name, namespace })
}

/// Server-side apply every object in `bytes`. Stops at the first failure;
/// objects applied before it stay applied.
pub async fn apply_manifest(client: Client, bytes: &[u8]) -> Result<ApplyResult> {
    let t0 = std::time::Instant::now();
    counter!("apply_attempts", 1u64);
    let docs = parse_manifest(bytes)?;
    let discovery = Discovery::new(client.clone()).run().await.context("running API discovery")?;
    let mut out = ApplyResult::default();
    for json in docs {
        let target = target_of(&json)?;
        let (ar, namespaced) = find_api_resource(&discovery, &target.gvk)?;
        let api: Api<DynamicObject> = if namespaced {
            match target.namespace.as_deref() {
                Some(n) => Api::namespaced_with(client.clone(), n, &ar),
                None => return Err(anyhow!("namespace required for namespaced kind {}", target.gvk.kind)),
            }
        } else {
            Api::all_with(client.clone(), &ar)
        };
        // CRDs are usually owned by another manager already; take the fields over.
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        match api.patch(&target.name, &pp, &Patch::Apply(&json)).await {
            Ok(obj) => {
                debug!(kind = %target.gvk.kind, name = %target.name, rv = ?obj.metadata.resource_version, "applied");
                out.applied.push(format!("{}/{}", target.gvk.kind, target.name));
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                return Err(anyhow!("server-side apply of {}/{} failed: {}", target.gvk.kind, target.name, e));
            }
        }
    }
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    counter!("apply_ok", 1u64);
    info!(objects = out.applied.len(), "manifest applied");
    Ok(out)
}

fn find_api_resource(discovery: &Discovery, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}
