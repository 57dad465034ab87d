//! cluster-sync - mirrors resources from a remote cluster per ResourceSyncRule

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use kube::api::ListParams;
use kube::{Api, CustomResourceExt, Resource};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cluster_sync::clusters::{AliveClusters, ClusterInfo};
use cluster_sync::config::{SyncConfig, DEFAULT_WATCH_TIMEOUT_SECS, DEFAULT_WORKERS};
use cluster_sync::controller::{SyncContext, SyncController};
use cluster_sync::crd::ResourceSyncRule;
use cluster_sync::events::KubeEventPublisher;
use cluster_sync::retry::{retry_with_backoff, RetryConfig};
use cluster_sync::sync::{RateLimiter, SyncRuleMatcher, WindowRateLimiter};
use cluster_sync::transport::{create_client, ClientTimeouts, ClusterApi, KubeClusterApi};

/// Controller name used for events and field management
const CONTROLLER_NAME: &str = "cluster-sync";

/// cluster-sync - mirror Kubernetes resources between clusters
#[derive(Parser, Debug)]
#[command(name = "cluster-sync", version, about, long_about = None)]
struct Cli {
    /// Generate the ResourceSyncRule CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one sync controller per ResourceSyncRule in the local cluster
    ///
    /// Objects are read from the remote cluster and written into the local
    /// one. Rules are read once at startup.
    Run(RunArgs),
}

/// Run mode arguments
#[derive(Parser, Debug)]
struct RunArgs {
    /// Kubeconfig of the remote (source) cluster
    #[arg(long, env = "REMOTE_KUBECONFIG")]
    remote_kubeconfig: PathBuf,

    /// Kubeconfig of the local (destination) cluster; in-cluster config when unset
    #[arg(long, env = "LOCAL_KUBECONFIG")]
    local_kubeconfig: Option<PathBuf>,

    /// Identity written into ownership markers; defaults to the remote cluster's id
    #[arg(long, env = "CLUSTER_ID")]
    cluster_id: Option<String>,

    /// Other cluster ids to treat as alive when arbitrating ownership
    #[arg(long, env = "ALIVE_CLUSTERS", value_delimiter = ',')]
    alive_clusters: Vec<String>,

    /// Concurrent workers per rule
    #[arg(long, env = "SYNC_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Deadline for one reconcile pass in seconds
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value = "30")]
    reconcile_timeout_secs: u64,

    /// Server-side watch timeout in seconds
    #[arg(long, env = "WATCH_TIMEOUT_SECS", default_value_t = DEFAULT_WATCH_TIMEOUT_SECS)]
    watch_timeout_secs: u32,

    /// Reconciles allowed per object per window; unlimited when unset
    #[arg(long, env = "RATE_LIMIT_MAX", value_parser = clap::value_parser!(u32).range(1..))]
    rate_limit_max: Option<u32>,

    /// Rate limit window in seconds
    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value = "60")]
    rate_limit_window_secs: u64,
}

impl RunArgs {
    fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig {
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout_secs),
            watch_timeout_secs: self.watch_timeout_secs,
            ..SyncConfig::default()
        }
        .with_workers(self.workers);
        if let Some(max) = self.rate_limit_max {
            config = config.with_rate_limit(max, Duration::from_secs(self.rate_limit_window_secs));
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ResourceSyncRule::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Run(args)) => run(args).await,
        None => Err(anyhow::anyhow!("no command given; use --crd or run")),
    }
}

/// Run one controller per rule until Ctrl-C
async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = args.sync_config();

    let local_client = create_client(args.local_kubeconfig.as_deref(), ClientTimeouts::default()).await?;
    let remote_client = create_client(Some(&args.remote_kubeconfig), ClientTimeouts::default()).await?;
    let local: Arc<dyn ClusterApi> =
        Arc::new(KubeClusterApi::new(local_client.clone(), config.watch_timeout_secs));
    let remote: Arc<dyn ClusterApi> =
        Arc::new(KubeClusterApi::new(remote_client, config.watch_timeout_secs));

    let claimant = match args.cluster_id {
        Some(id) => id,
        None => remote.cluster_id().await?,
    };
    info!(cluster_id = %claimant, "syncing from remote cluster");

    let clusters = Arc::new(AliveClusters::new());
    clusters.mark_alive(claimant.clone(), ClusterInfo::new("remote"));
    for id in &args.alive_clusters {
        clusters.mark_alive(id.clone(), ClusterInfo::new(id.clone()));
    }

    let rules_api: Api<ResourceSyncRule> = Api::all(local_client.clone());
    let rules = retry_with_backoff(
        &RetryConfig::with_max_attempts(5),
        "list ResourceSyncRules",
        || async { rules_api.list(&ListParams::default()).await },
    )
    .await?;

    let limiter: Option<Arc<dyn RateLimiter>> = config.rate_limit.as_ref().map(|rl| {
        Arc::new(WindowRateLimiter::new(rl.max_per_window, rl.window)) as Arc<dyn RateLimiter>
    });
    let events = Arc::new(KubeEventPublisher::new(local_client, CONTROLLER_NAME));
    let shutdown = CancellationToken::new();

    let mut controllers = Vec::new();
    for rule in rules {
        let matcher = match SyncRuleMatcher::new(rule.spec.clone()) {
            Ok(matcher) => matcher,
            Err(e) => {
                error!(rule = ?rule.metadata.name, error = %e, "skipping invalid ResourceSyncRule");
                continue;
            }
        };

        let mut ctx = SyncContext::builder(
            claimant.clone(),
            Arc::clone(&remote),
            Arc::clone(&local),
            Arc::new(matcher),
        )
        .rule(rule.object_ref(&()))
        .clusters(clusters.clone())
        .events(events.clone());
        if let Some(limiter) = &limiter {
            ctx = ctx.rate_limiter(Arc::clone(limiter));
        }

        let controller = SyncController::new(ctx, config.clone(), shutdown.clone());
        controllers.push(tokio::spawn(controller.run()));
    }

    if controllers.is_empty() {
        warn!("no ResourceSyncRules found, nothing to sync");
    }

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    shutdown.cancel();
    join_all(controllers).await;
    Ok(())
}
