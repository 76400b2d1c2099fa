//! CRD manifest set and the sources manifests are fetched from.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_SET: &str = include_str!("../crds.yaml");

/// One schema-extension resource and where its manifest lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdManifest {
    pub kind: String,
    pub url: String,
}

/// Ordered list of CRD manifests pinned to a single upstream version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdManifestSet {
    pub version: String,
    pub manifests: Vec<CrdManifest>,
}

impl CrdManifestSet {
    /// The set shipped with obsctl.
    pub fn embedded() -> Result<Self> {
        Self::from_yaml(DEFAULT_SET).context("parsing embedded CRD manifest set")
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let set: CrdManifestSet = serde_yaml::from_str(yaml).context("parsing CRD manifest set")?;
        if set.version.trim().is_empty() {
            return Err(anyhow!("CRD manifest set is missing a version"));
        }
        Ok(set)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text)
    }

    /// Entries with `{version}` substituted, in declaration order.
    pub fn resolved(&self) -> Vec<CrdManifest> {
        self.manifests
            .iter()
            .map(|m| CrdManifest { kind: m.kind.clone(), url: m.url.replace("{version}", &self.version) })
            .collect()
    }
}

/// Where raw manifest bytes come from.
#[async_trait::async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

/// Plain HTTP(S) GET; `file://` URLs are read from disk for offline fixtures.
pub struct HttpManifestSource {
    http: reqwest::Client,
}

impl HttpManifestSource {
    pub fn new() -> Result<Self> {
        let secs = std::env::var("OBS_HTTP_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(30);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(secs))
            .build()
            .context("building HTTP client")?;
        Ok(Self { http })
    }
}

#[async_trait::async_trait]
impl ManifestSource for HttpManifestSource {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        if let Some(path) = url.strip_prefix("file://") {
            let data = tokio::fs::read(path).await.with_context(|| format!("reading manifest {}", path))?;
            return Ok(Bytes::from(data));
        }
        debug!(url = %url, "fetching manifest");
        let resp = self.http.get(url).send().await.with_context(|| format!("fetching {}", url))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("fetching {}: HTTP {}", url, status));
        }
        resp.bytes().await.with_context(|| format!("reading body of {}", url))
    }
}
