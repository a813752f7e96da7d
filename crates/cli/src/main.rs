use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use helmsync_core::{DesiredRelease, ResourceKey};
use helmsync_engine::{ChartChangeSync, Clients, Config, DesiredReleases};
use helmsync_kubehub::{KubeHub, ResourceChange};
use helmsync_release::{HelmCli, ValuesResolver};
use helmsync_source::{ChartSourceRegistry, GitMirrors};
use metrics::counter;
use tokio::signal;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "helmsync", version, about = "Keep Helm releases in sync with HelmRelease resources")]
struct Cli {
    /// Output format for one-shot commands
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Only handle HelmReleases in this namespace (default: all)
    #[arg(long = "namespace", env = "HELMSYNC_NAMESPACE", global = true)]
    namespace: Option<String>,

    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug)]
struct EngineArgs {
    /// Directory for charts fetched from chart repositories
    #[arg(long = "chart-cache", env = "HELMSYNC_CHART_CACHE", global = true)]
    chart_cache: Option<PathBuf>,

    /// Log structural diffs of diverged releases
    #[arg(long = "log-diffs", env = "HELMSYNC_LOG_DIFFS", action = ArgAction::SetTrue, global = true)]
    log_diffs: bool,

    /// Run `helm dependency update` on git charts before installing
    #[arg(long = "update-chart-deps", env = "HELMSYNC_UPDATE_CHART_DEPS", default_value_t = true, action = ArgAction::Set, global = true)]
    update_chart_deps: bool,

    /// Path to the helm binary
    #[arg(long = "helm-bin", env = "HELMSYNC_HELM_BIN", default_value = "helm", global = true)]
    helm_bin: PathBuf,

    /// Kube context passed to helm
    #[arg(long = "kube-context", env = "HELMSYNC_KUBE_CONTEXT", global = true)]
    kube_context: Option<String>,

    /// Path to the git binary
    #[arg(long = "git-bin", env = "HELMSYNC_GIT_BIN", default_value = "git", global = true)]
    git_bin: PathBuf,

    /// Directory holding git mirrors and chart exports
    #[arg(long = "git-dir", env = "HELMSYNC_GIT_DIR", global = true)]
    git_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator until interrupted
    Run {
        /// Reconcile passes running at once
        #[arg(long = "workers", env = "HELMSYNC_WORKERS", default_value_t = 4)]
        workers: usize,
        /// Seconds between full reconciliation sweeps
        #[arg(long = "charts-sync-interval", env = "HELMSYNC_CHARTS_SYNC_INTERVAL", default_value_t = 180)]
        charts_sync_interval: u64,
        /// Seconds between git mirror refreshes
        #[arg(long = "git-poll-interval", env = "HELMSYNC_GIT_POLL_INTERVAL", default_value_t = 300)]
        git_poll_interval: u64,
    },
    /// Reconcile one HelmRelease and exit
    Reconcile {
        /// Resource, e.g. "apps:helmrelease/redis"
        resource: String,
    },
    /// Report whether a HelmRelease's values still match the recorded checksum
    Checksum {
        /// Resource, e.g. "apps:helmrelease/redis"
        resource: String,
    },
}

fn init_tracing() {
    let env = std::env::var("HELMSYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("HELMSYNC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid HELMSYNC_METRICS_ADDR; expected host:port");
        }
    }
}

fn build_engine(args: &EngineArgs, hub: Arc<KubeHub>) -> ChartChangeSync {
    let defaults = Config::default();
    let git_dir = args.git_dir.clone().unwrap_or_else(|| std::env::temp_dir().join("helmsync"));
    let values = Arc::new(ValuesResolver::new(hub.clone()));
    let helm = Arc::new(HelmCli::new(&args.helm_bin, args.kube_context.clone(), values.clone()));
    let mirrors = Arc::new(GitMirrors::new(&args.git_bin, git_dir.join("mirrors")));
    let sources = Arc::new(ChartSourceRegistry::new(mirrors, git_dir.join("exports")));
    let config = Config {
        chart_cache: args.chart_cache.clone().unwrap_or(defaults.chart_cache),
        log_diffs: args.log_diffs,
        update_deps: args.update_chart_deps,
    };
    info!(chart_cache = %config.chart_cache.display(), git_dir = %git_dir.display(), update_deps = config.update_deps, "engine configured");
    let clients = Clients { gateway: helm.clone(), status: hub.clone(), releases: hub, values };
    ChartChangeSync::new(config, clients, sources, helm)
}

async fn reconcile_logged(engine: &ChartChangeSync, hr: &DesiredRelease) {
    match engine.reconcile(hr).await {
        Ok(outcome) => debug!(resource = %hr.key(), outcome = outcome.as_str(), "reconciled"),
        // Already recorded on the resource status.
        Err(e) => debug!(resource = %hr.key(), error = %e, "reconcile ended early"),
    }
}

async fn sweep(engine: &ChartChangeSync, hub: &KubeHub, workers: usize) {
    let releases = match hub.list().await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = ?e, "unable to list HelmReleases");
            return;
        }
    };
    info!(count = releases.len(), "reconciliation sweep");
    counter!("sweeps_total", 1u64);
    futures::stream::iter(releases)
        .for_each_concurrent(workers.max(1), |hr| async move { reconcile_logged(engine, &hr).await })
        .await;
}

async fn poll_mirrors(engine: &ChartChangeSync, hub: &KubeHub, workers: usize) {
    let changed = engine.sync_mirrors().await;
    futures::stream::iter(changed)
        .for_each_concurrent(workers.max(1), |key| async move {
            match hub.get(&key.namespace, &key.name).await {
                Ok(hr) => reconcile_logged(engine, &hr).await,
                Err(e) => warn!(resource = %key, error = %e, "chart source moved but HelmRelease is unavailable"),
            }
        })
        .await;
}

async fn run(engine: Arc<ChartChangeSync>, hub: Arc<KubeHub>, workers: usize, sync_every: Duration, poll_every: Duration) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<ResourceChange>(256);

    let watcher = tokio::spawn({
        let hub = hub.clone();
        async move {
            if let Err(e) = hub.watch(tx).await {
                error!(error = ?e, "HelmRelease watcher failed");
            }
        }
    });

    let sweeper = tokio::spawn({
        let (engine, hub) = (engine.clone(), hub.clone());
        async move {
            let mut tick = tokio::time::interval(sync_every);
            loop {
                tick.tick().await;
                sweep(&engine, &hub, workers).await;
            }
        }
    });

    let poller = tokio::spawn({
        let (engine, hub) = (engine.clone(), hub.clone());
        async move {
            let mut tick = tokio::time::interval(poll_every);
            loop {
                tick.tick().await;
                poll_mirrors(&engine, &hub, workers).await;
            }
        }
    });

    // Event-driven passes share the worker bound; the engine serializes passes per resource.
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let events = tokio::spawn({
        let engine = engine.clone();
        async move {
            while let Some(change) = rx.recv().await {
                match change {
                    ResourceChange::Applied(hr) => {
                        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else { break };
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            reconcile_logged(&engine, &hr).await;
                            drop(permit);
                        });
                    }
                    ResourceChange::Deleted(hr) => {
                        info!(resource = %hr.key(), "HelmRelease deleted");
                        // Failures are logged by the engine; nothing is left to record them on.
                        let _ = engine.delete_release(&hr).await;
                    }
                }
            }
        }
    });

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Ctrl-C received; shutting down");
    for task in [watcher, sweeper, poller, events] {
        task.abort();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let hub = Arc::new(KubeHub::connect(cli.namespace.clone()).await?);
    let engine = Arc::new(build_engine(&cli.engine, hub.clone()));

    match cli.command {
        Commands::Run { workers, charts_sync_interval, git_poll_interval } => {
            info!(workers, charts_sync_interval, git_poll_interval, ns = ?cli.namespace, "starting operator");
            run(engine, hub, workers, Duration::from_secs(charts_sync_interval.max(1)), Duration::from_secs(git_poll_interval.max(1)))
                .await?;
        }
        Commands::Reconcile { resource } => {
            let key = ResourceKey::from_str(&resource)?;
            let hr = hub.get(&key.namespace, &key.name).await?;
            let result = engine.reconcile(&hr).await;
            match cli.output {
                Output::Human => match &result {
                    Ok(outcome) => println!("{key}: {}", outcome.as_str()),
                    Err(e) => println!("{key}: {e}"),
                },
                Output::Json => {
                    let (outcome, error) = match &result {
                        Ok(o) => (Some(o.as_str()), None),
                        Err(e) => (None, Some(e.to_string())),
                    };
                    println!("{}", serde_json::json!({ "resource": key.to_string(), "outcome": outcome, "error": error }));
                }
            }
            result?;
        }
        Commands::Checksum { resource } => {
            let key = ResourceKey::from_str(&resource)?;
            let hr = hub.get(&key.namespace, &key.name).await?;
            let matches = engine.compare_values_checksum(&hr).await;
            match cli.output {
                Output::Human => println!("{key}: values {}", if matches { "unchanged" } else { "changed" }),
                Output::Json => println!("{}", serde_json::json!({ "resource": key.to_string(), "matches": matches })),
            }
        }
    }
    Ok(())
}
