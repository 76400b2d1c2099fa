//! Decides whether a run installs, upgrades or has nothing to do.

use obs_core::{ordinal, DeployedRelease, MigrationDecision, TargetChart, DEFAULT_ORDINAL_WIDTH};
use obs_helm::{ChartService, DEFAULT_CHART_REFERENCE, DEFAULT_REPO_NAME};
use tracing::{debug, info};

use crate::error::{Result, StepContext, UpgradeError};

pub struct InspectRequest<'a> {
    pub release: &'a str,
    pub namespace: &'a str,
    pub target: &'a TargetChart,
    pub same_chart: bool,
    pub repo_url: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpgradePlan {
    pub deployed: DeployedRelease,
    pub latest_version: String,
    pub found_new_chart: bool,
    pub decision: MigrationDecision,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inspection {
    FreshInstall,
    Upgrade(UpgradePlan),
}

pub struct DeploymentInspector<'a> {
    charts: &'a dyn ChartService,
}

impl<'a> DeploymentInspector<'a> {
    pub fn new(charts: &'a dyn ChartService) -> Self { Self { charts } }

    /// Read-only apart from the optional repository refresh.
    pub async fn inspect(&self, req: &InspectRequest<'_>) -> Result<Inspection> {
        let deployed = match self.charts.deployed_release(req.release, req.namespace).await.step("read deployed release")? {
            Some(d) => d,
            None => {
                info!(release = req.release, namespace = req.namespace, "release not found; fresh install");
                return Ok(Inspection::FreshInstall);
            }
        };

        let chart_ref = req.target.chart_reference.as_str();
        let version = req.target.requested_version.as_deref();
        if !req.same_chart && chart_ref == DEFAULT_CHART_REFERENCE {
            self.charts.add_or_refresh_repo(DEFAULT_REPO_NAME, req.repo_url).await.step("refresh chart repository")?;
        }
        let latest = self.charts.chart_metadata(chart_ref, version).await.step("read chart metadata")?;

        let latest_ord = ordinal(&latest.version, DEFAULT_ORDINAL_WIDTH)?;
        let deployed_ord = ordinal(&deployed.chart_version, DEFAULT_ORDINAL_WIDTH)?;
        debug!(deployed = %deployed.chart_version, latest = %latest.version, "chart versions");

        let found_new_chart = latest_ord > deployed_ord;
        let mut values_equal = false;
        if found_new_chart {
            if req.same_chart {
                return Err(UpgradeError::ChartConflict {
                    deployed: deployed.chart_version.clone(),
                    latest: latest.version.clone(),
                });
            }
        } else {
            let target_values = self
                .charts
                .values_for_chart(chart_ref, version, req.target.override_values_file.as_deref())
                .await
                .step("compute target values")?;
            values_equal = target_values == deployed.computed_values;
            if values_equal {
                return Err(UpgradeError::NoUpgradeAvailable {
                    release: deployed.release_name.clone(),
                    deployed: deployed.chart_version.clone(),
                });
            }
            info!(release = %deployed.release_name, "chart unchanged but values differ; values-only upgrade");
        }

        let decision = MigrationDecision::between(&deployed.chart_version, &latest.version, values_equal)?;
        Ok(Inspection::Upgrade(UpgradePlan { latest_version: latest.version, deployed, found_new_chart, decision }))
    }
}
