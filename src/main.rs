//! cStor Pool Manager
//!
//! Node agent that keeps the local cStor pool and its volume replicas in
//! step with their `CStorPool` and `CStorVolumeReplica` resources.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cstor_pool_mgmt::config::{self, DATASET_TOOL, DEFAULT_THREADS, POOL_TOOL};
use cstor_pool_mgmt::{
    telemetry, CStorPool, CStorVolumeReplica, KubeStore, Operator, OperatorConfig, ReadOnlyRelease,
    RealRunner,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// cStor Pool Manager - reconciles cStor pools and volume replicas on this node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Workers per reconciler
    #[arg(long, env = "THREADS", default_value_t = DEFAULT_THREADS)]
    threads: usize,

    /// Pool management binary
    #[arg(long, env = "POOL_TOOL", default_value = POOL_TOOL)]
    pool_tool: String,

    /// Dataset management binary
    #[arg(long, env = "DATASET_TOOL", default_value = DATASET_TOOL)]
    dataset_tool: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// When a pool latched read-only by the usage threshold becomes writable again
    #[arg(long, env = "READ_ONLY_RELEASE", value_enum, default_value_t = ReadOnlyRelease::Manual)]
    read_only_release: ReadOnlyRelease,

    /// UID of the CStorPool this node manages
    #[arg(long, env = config::CSTOR_ID_ENV, required_unless_present = "print_crds")]
    cstor_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the CustomResourceDefinitions as YAML and exit
    #[arg(long)]
    print_crds: bool,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            threads: self.threads,
            pool_tool: self.pool_tool.clone(),
            dataset_tool: self.dataset_tool.clone(),
            resync_interval: config::resync_interval(),
            read_only_release: self.read_only_release,
            cstor_id: self.cstor_id.clone().unwrap_or_default(),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_crds {
        print!("{}", serde_yaml::to_string(&CStorPool::crd())?);
        println!("---");
        print!("{}", serde_yaml::to_string(&CStorVolumeReplica::crd())?);
        return Ok(());
    }

    init_logging(&args)?;

    let config = args.operator_config();
    config.validate()?;
    info!("Starting cStor Pool Manager");
    info!("  Version: {}", cstor_pool_mgmt::VERSION);
    info!("  Threads: {}", config.threads);
    info!("  Pool tool: {}", config.pool_tool);
    info!("  Dataset tool: {}", config.dataset_tool);
    info!("  Resync interval: {:?}", config.resync_interval);
    info!("  Read-only release: {}", config.read_only_release);
    info!("  Pool UID: {}", config.cstor_id);

    let client = Client::try_default()
        .await
        .context("unable to build Kubernetes client")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let operator = Operator::new(
        config,
        Arc::new(RealRunner::new()),
        Arc::new(KubeStore::<CStorPool>::cluster(client.clone())),
        Arc::new(KubeStore::<CStorVolumeReplica>::namespaced(client.clone())),
    );

    // Start health server
    let health_addr = args.health_addr.clone();
    let gate = operator.gate().clone();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = telemetry::run_health_server(&health_addr, gate, token).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = telemetry::run_metrics_server(&metrics_addr, token).await {
            error!("Metrics server error: {}", e);
        }
    });

    let informers = operator.informers(&client, &shutdown);
    operator
        .run(informers, shutdown)
        .await
        .context("pool manager stopped")?;

    info!("Pool manager shutdown complete");
    Ok(())
}

// =============================================================================
// Signals
// =============================================================================

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received interrupt, shutting down"),
                    _ = term.recv() => info!("Received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                error!("Unable to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received interrupt, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received interrupt, shutting down");
    }
    shutdown.cancel();
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("kube=info".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}
