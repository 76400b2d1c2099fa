use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use obs_apply::{CrdManifestSet, HttpManifestSource};
use obs_core::TargetChart;
use obs_helm::{HelmCli, DEFAULT_CHART_REFERENCE, DEFAULT_REPO_URL};
use obs_kubehub::KubeCluster;
use obs_upgrade::{PollPolicy, StdinConfirm, UpgradeOrchestrator, UpgradeOutcome, UpgradeRequest};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "obsctl", version, about = "Operate the observability stack release")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Release name
    #[arg(short = 'n', long = "name", global = true, env = "OBS_RELEASE", default_value = "tobs")]
    name: String,

    /// Namespace the release lives in
    #[arg(long = "namespace", global = true, env = "OBS_NAMESPACE", default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upgrade the release to the latest chart, migrating what the new layout needs
    Upgrade(UpgradeArgs),
}

#[derive(clap::Args, Debug)]
struct UpgradeArgs {
    /// Values file overriding chart defaults
    #[arg(short = 'f', long = "filename")]
    filename: Option<PathBuf>,
    /// Chart to upgrade to (repo/name or local path)
    #[arg(short = 'c', long = "chart-reference", default_value = DEFAULT_CHART_REFERENCE)]
    chart_reference: String,
    /// Helm repository the chart reference resolves against
    #[arg(long = "repo-url", env = "OBS_CHART_REPO_URL", default_value = DEFAULT_REPO_URL)]
    repo_url: String,
    /// Pin the chart version instead of taking the latest
    #[arg(long = "version")]
    chart_version: Option<String>,
    /// Reset values to the chart's defaults before applying overrides
    #[arg(long = "reset-values", action = ArgAction::SetTrue)]
    reset_values: bool,
    /// Reuse the release's last values and merge overrides
    #[arg(long = "reuse-values", action = ArgAction::SetTrue)]
    reuse_values: bool,
    /// Only re-apply the deployed chart; refuse to move to a newer one
    #[arg(long = "same-chart", action = ArgAction::SetTrue)]
    same_chart: bool,
    /// Do not ask for confirmation
    #[arg(short = 'y', long = "confirm", action = ArgAction::SetTrue)]
    confirm: bool,
    /// Do not install the operator CRDs
    #[arg(long = "skip-crds", action = ArgAction::SetTrue)]
    skip_crds: bool,
    /// YAML file listing the CRD manifests to install (default: built in)
    #[arg(long = "crd-manifests")]
    crd_manifests: Option<PathBuf>,
    /// Seconds the chart apply waits for workloads
    #[arg(long = "timeout")]
    timeout: Option<u64>,
    /// Overall bound in seconds on waiting for Prometheus pods to stop
    #[arg(long = "drain-timeout")]
    drain_timeout: Option<u64>,
}

fn init_tracing() {
    let env = std::env::var("OBS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("OBS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid OBS_METRICS_ADDR; expected host:port");
        }
    }
}

fn upgrade_request(cli: &Cli, args: &UpgradeArgs) -> UpgradeRequest {
    let target = TargetChart {
        chart_reference: args.chart_reference.clone(),
        requested_version: args.chart_version.clone(),
        override_values_file: args.filename.clone(),
    };
    let mut req = UpgradeRequest::new(&cli.name, &cli.namespace, target);
    req.repo_url = args.repo_url.clone();
    req.reset_values = args.reset_values;
    req.reuse_values = args.reuse_values;
    req.same_chart = args.same_chart;
    req.confirm = args.confirm;
    req.skip_crds = args.skip_crds;
    req.timeout = args.timeout.map(Duration::from_secs);
    req
}

async fn upgrade(cli: &Cli, args: &UpgradeArgs, cancel: CancellationToken) -> Result<UpgradeOutcome> {
    let crds = match &args.crd_manifests {
        Some(path) => CrdManifestSet::from_file(path)?,
        None => CrdManifestSet::embedded()?,
    };
    let cluster = KubeCluster::connect().await?;
    let charts = HelmCli::new();
    let manifests = HttpManifestSource::new()?;
    let poll = PollPolicy::from_env().with_deadline(args.drain_timeout.map(Duration::from_secs));
    let req = upgrade_request(cli, args);
    info!(release = %req.release, namespace = %req.namespace, chart = %req.target.chart_reference, "upgrade invoked");

    let orchestrator = UpgradeOrchestrator::new(&charts, &cluster, &manifests, &StdinConfirm, crds)
        .with_poll(poll)
        .with_cancel(cancel);
    orchestrator.run(&req).await.context("upgrade failed")
}

fn render(output: Output, outcome: &UpgradeOutcome) -> Result<()> {
    match output {
        Output::Human => {
            for step in &outcome.steps {
                println!("{}", step);
            }
            let from = outcome.from_version.as_deref().unwrap_or("-");
            println!(
                "release {} in {}: {} -> {} (revision {}, {})",
                outcome.release.name, outcome.release.namespace, from, outcome.to_version, outcome.release.revision, outcome.release.status
            );
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(outcome)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; stopping after the current step");
                cancel.cancel();
            }
        }
    });

    let res = match &cli.command {
        Commands::Upgrade(args) => match upgrade(&cli, args, cancel).await {
            Ok(outcome) => render(cli.output, &outcome),
            Err(e) => Err(e),
        },
    };
    if let Err(e) = res {
        error!(error = ?e, "obsctl failed");
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
