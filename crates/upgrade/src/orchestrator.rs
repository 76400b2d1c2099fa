//! Top-level sequencing of an upgrade run.

use std::io::{BufRead, Write};
use std::time::{Duration, Instant};

use anyhow::Context;
use metrics::{counter, histogram};
use obs_apply::{CrdManifestSet, ManifestSource};
use obs_core::{MigrationDecision, TargetChart};
use obs_helm::{ChartApplySpec, ChartService, ReleaseResult, DEFAULT_REPO_URL};
use obs_kubehub::ClusterService;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::error::{Result, StepContext, UpgradeError};
use crate::inspector::{DeploymentInspector, InspectRequest, Inspection, UpgradePlan};
use crate::ledger::MigrationLedger;
use crate::names::ResourceNames;
use crate::poll::PollPolicy;
use crate::reconciler::ClusterResourceReconciler;
use crate::report::StepReport;
use crate::secrets::SecretMigrator;

/// Asks the operator before anything destructive happens.
#[async_trait::async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, prompt: &str) -> anyhow::Result<bool>;
}

/// Prompt on stderr, answer on stdin. Only `y`/`yes` confirm.
pub struct StdinConfirm;

fn read_answer(prompt: &str) -> anyhow::Result<bool> {
    let mut err = std::io::stderr();
    write!(err, "{} [y/N] ", prompt)?;
    err.flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

#[async_trait::async_trait]
impl Confirm for StdinConfirm {
    async fn confirm(&self, prompt: &str) -> anyhow::Result<bool> {
        // The terminal read blocks; keep it off the runtime workers.
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || read_answer(&prompt)).await.context("confirmation prompt panicked")?
    }
}

#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub release: String,
    pub namespace: String,
    pub target: TargetChart,
    pub reset_values: bool,
    pub reuse_values: bool,
    pub same_chart: bool,
    /// Skip the interactive confirmation.
    pub confirm: bool,
    pub skip_crds: bool,
    /// Forwarded to the chart tool's wait.
    pub timeout: Option<Duration>,
    pub repo_url: String,
}

impl UpgradeRequest {
    /// Defaults everywhere; the published repository as `repo_url`.
    pub fn new(release: impl Into<String>, namespace: impl Into<String>, target: TargetChart) -> Self {
        Self {
            release: release.into(),
            namespace: namespace.into(),
            target,
            reset_values: false,
            reuse_values: false,
            same_chart: false,
            confirm: false,
            skip_crds: false,
            timeout: None,
            repo_url: DEFAULT_REPO_URL.to_string(),
        }
    }

    fn apply_spec(&self, version: Option<String>) -> ChartApplySpec {
        ChartApplySpec {
            release_name: self.release.clone(),
            namespace: self.namespace.clone(),
            chart_reference: self.target.chart_reference.clone(),
            version,
            values_file: self.target.override_values_file.clone(),
            reset_values: self.reset_values,
            reuse_values: self.reuse_values,
            timeout: self.timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Installed,
    Upgraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpgradeOutcome {
    pub kind: OutcomeKind,
    pub decision: MigrationDecision,
    pub from_version: Option<String>,
    pub to_version: String,
    pub steps: Vec<StepReport>,
    pub release: ReleaseResult,
}

pub struct UpgradeOrchestrator<'a> {
    charts: &'a dyn ChartService,
    cluster: &'a dyn ClusterService,
    manifests: &'a dyn ManifestSource,
    confirm: &'a dyn Confirm,
    crds: CrdManifestSet,
    poll: PollPolicy,
    cancel: CancellationToken,
}

impl<'a> UpgradeOrchestrator<'a> {
    pub fn new(
        charts: &'a dyn ChartService,
        cluster: &'a dyn ClusterService,
        manifests: &'a dyn ManifestSource,
        confirm: &'a dyn Confirm,
        crds: CrdManifestSet,
    ) -> Self {
        Self { charts, cluster, manifests, confirm, crds, poll: PollPolicy::from_env(), cancel: CancellationToken::new() }
    }

    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self, req: &UpgradeRequest) -> Result<UpgradeOutcome> {
        let span = info_span!("upgrade", release = %req.release, namespace = %req.namespace);
        async {
            let t0 = Instant::now();
            counter!("upgrade_runs", 1u64);
            let res = self.run_inner(req).await;
            histogram!("upgrade_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            match &res {
                Ok(out) => info!(to = %out.to_version, steps = out.steps.len(), "upgrade finished"),
                Err(e) if e.is_pre_mutation() => info!(error = %e, "nothing changed"),
                Err(e) => error!(error = %e, "upgrade failed; cluster may be partially migrated"),
            }
            res
        }
        .instrument(span)
        .await
    }

    async fn run_inner(&self, req: &UpgradeRequest) -> Result<UpgradeOutcome> {
        let inspect = InspectRequest {
            release: &req.release,
            namespace: &req.namespace,
            target: &req.target,
            same_chart: req.same_chart,
            repo_url: &req.repo_url,
        };
        let plan = match DeploymentInspector::new(self.charts).inspect(&inspect).await? {
            Inspection::FreshInstall => {
                self.checkpoint("installing the chart")?;
                return self.install(req).await;
            }
            Inspection::Upgrade(plan) => plan,
        };

        if !req.confirm {
            self.checkpoint("waiting for confirmation")?;
            let prompt = confirm_prompt(req, &plan);
            let answer = tokio::select! {
                _ = self.cancel.cancelled() => return Err(UpgradeError::Cancelled("waiting for confirmation")),
                answer = self.confirm.confirm(&prompt) => answer.step("read confirmation")?,
            };
            if !answer {
                return Err(UpgradeError::Aborted);
            }
        }

        let decision = plan.decision;
        let from = plan.deployed.chart_version.clone();
        let names = ResourceNames::new(&req.release);
        let ledger = MigrationLedger::new(self.cluster, &req.namespace, names.clone(), &from, &plan.latest_version);
        let mut steps = Vec::new();

        // Cluster resources go before secrets even when both boundaries are crossed.
        if decision.crosses_resource_boundary {
            self.checkpoint("reconciling cluster resources")?;
            info!(from = %from, to = %plan.latest_version, "0.4.0 layout: reconciling cluster resources");
            let reconciler = ClusterResourceReconciler {
                cluster: self.cluster,
                manifests: self.manifests,
                ledger: &ledger,
                names: &names,
                namespace: &req.namespace,
                crds: &self.crds,
                skip_crds: req.skip_crds,
                migrate_volume: decision.requires_volume_migration,
                poll: self.poll.clone(),
                cancel: self.cancel.clone(),
            };
            steps.extend(tally("resources", reconciler.run().await)?);
        }

        if decision.crosses_secret_boundary {
            self.checkpoint("migrating secrets")?;
            info!(from = %from, to = %plan.latest_version, "0.2.2 layout: migrating secrets");
            let secrets = SecretMigrator::new(self.cluster, &ledger, &names, &req.namespace);
            steps.extend(tally("secrets", secrets.run().await)?);
        }

        self.checkpoint("applying the chart")?;
        let spec = req.apply_spec(Some(plan.latest_version.clone()));
        let release = tally("chart-apply", self.charts.apply_chart(&spec).await.step("apply chart"))?;
        info!(revision = release.revision, version = %release.chart_version, "chart applied");
        steps.push(StepReport::done("chart-apply", format!("revision {}", release.revision)));

        Ok(UpgradeOutcome {
            kind: OutcomeKind::Upgraded,
            decision,
            from_version: Some(from),
            to_version: plan.latest_version,
            steps,
            release,
        })
    }

    /// Stop between stages once the run was cancelled.
    fn checkpoint(&self, stage: &'static str) -> Result<()> {
        if self.cancel.is_cancelled() {
            info!(stage, "run cancelled; stopping before the next stage");
            return Err(UpgradeError::Cancelled(stage));
        }
        Ok(())
    }

    async fn install(&self, req: &UpgradeRequest) -> Result<UpgradeOutcome> {
        let spec = req.apply_spec(req.target.requested_version.clone());
        let release = tally("install", self.charts.install_chart(&spec).await.step("install chart"))?;
        info!(revision = release.revision, version = %release.chart_version, "chart installed");
        Ok(UpgradeOutcome {
            kind: OutcomeKind::Installed,
            decision: MigrationDecision::fresh_install(),
            from_version: None,
            to_version: release.chart_version.clone(),
            steps: vec![StepReport::done("install", format!("revision {}", release.revision))],
            release,
        })
    }
}

fn tally<T>(stage: &'static str, res: Result<T>) -> Result<T> {
    match &res {
        Ok(_) => {
            counter!("upgrade_step_ok", 1u64, "stage" => stage);
        }
        Err(_) => {
            counter!("upgrade_step_err", 1u64, "stage" => stage);
        }
    }
    res
}

fn confirm_prompt(req: &UpgradeRequest, plan: &UpgradePlan) -> String {
    let mut prompt = if plan.found_new_chart {
        format!(
            "Upgrade release {} in {} from chart {} to {}?",
            req.release, req.namespace, plan.deployed.chart_version, plan.latest_version
        )
    } else {
        format!("Re-apply chart {} to release {} in {} with new values?", plan.latest_version, req.release, req.namespace)
    };
    if plan.decision.requires_volume_migration {
        prompt.push_str(" The Prometheus volume will be moved to a new claim; this cannot be undone.");
    } else if plan.decision.needs_migration() {
        prompt.push_str(" Secrets and cluster resources will be migrated.");
    }
    prompt
}
