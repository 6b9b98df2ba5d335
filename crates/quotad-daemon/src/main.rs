//! quotad - per-node local volume pool and quota agent.
//!
//! Settings come from an optional TOML file, overridden by flags, which in
//! turn fall back to environment variables. Startup is synchronous up to the
//! construction of the Tokio runtime; everything after runs in
//! [`async_main`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;
use clap::Parser;
use quotad_core::units::Quantity;
use quotad_core::{AgentConfig, DirectoryAllocator, OrchestratorClient, QuotaBackend, XfsQuota};
use quotad_daemon::collector::MetricsCollector;
use quotad_daemon::disk::{ProcFs, filesystem_capacity};
use quotad_daemon::kube::{KubeClient, KubeConfig};
use quotad_daemon::metrics::{SharedMetricsRegistry, new_shared_registry};
use quotad_daemon::{ClaimUpdateHandler, ClaimWatcher, QuotaSyncHandler, VolumePoolReconciler};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// quotad - local volume pool and XFS project quota agent
#[derive(Parser, Debug)]
#[command(name = "quotad")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "QUOTAD_CONFIG")]
    config: Option<PathBuf>,

    /// Name of the node this agent runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Root of the managed directories; must be the XFS mount point
    #[arg(long, env = "BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// Number of unbound volumes to keep available
    #[arg(long, env = "AVAILABLE_NUM")]
    available_num: Option<usize>,

    /// Interval between volume pool reconciliations (e.g. "5s")
    #[arg(long, env = "LIST_DURATION", value_parser = humantime::parse_duration)]
    list_duration: Option<Duration>,

    /// Interval between claim listings (e.g. "30s")
    #[arg(long, env = "DEFAULT_RESYNC", value_parser = humantime::parse_duration)]
    default_resync: Option<Duration>,

    /// Interval between metric collections (e.g. "30s")
    #[arg(long, env = "RECORD_DURATION", value_parser = humantime::parse_duration)]
    record_duration: Option<Duration>,

    /// Capacity advertised on new volumes (e.g. "100Gi"); defaults to the
    /// size of the base directory's filesystem
    #[arg(long, env = "STORAGE")]
    storage: Option<String>,

    /// Storage class of the managed volumes
    #[arg(long, env = "STORAGE_CLASS_NAME")]
    storage_class_name: Option<String>,

    /// Path or name of the xfs_quota binary
    #[arg(long, env = "QUOTA_BINARY")]
    quota_binary: Option<PathBuf>,

    /// Address of the Prometheus metrics endpoint
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    /// Loads the configuration file, if any, and applies flag overrides.
    fn load_config(&self) -> Result<AgentConfig> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::from_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => AgentConfig::default(),
        };

        if let Some(node_name) = &self.node_name {
            config.node_name.clone_from(node_name);
        }
        if let Some(base_dir) = &self.base_dir {
            config.base_dir.clone_from(base_dir);
        }
        if let Some(available_num) = self.available_num {
            config.available_num = available_num;
        }
        if let Some(interval) = self.list_duration {
            config.list_interval = interval;
        }
        if let Some(interval) = self.default_resync {
            config.resync_interval = interval;
        }
        if let Some(interval) = self.record_duration {
            config.metrics_interval = interval;
        }
        if self.storage.is_some() {
            config.storage.clone_from(&self.storage);
        }
        if let Some(class) = &self.storage_class_name {
            config.storage_class_name.clone_from(class);
        }
        if let Some(binary) = &self.quota_binary {
            config.quota_binary.clone_from(binary);
        }
        if let Some(addr) = self.metrics_addr {
            config.metrics_addr = addr;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

async fn async_main(args: Args) -> Result<()> {
    init_tracing(&args)?;

    let config = Arc::new(args.load_config()?);
    info!(
        node = %config.node_name,
        base_dir = %config.base_dir.display(),
        available_num = config.available_num,
        storage_class = %config.storage_class_name,
        "starting quotad"
    );

    let capacity = match &config.storage {
        Some(storage) => Quantity::parse(storage).context("invalid storage quantity")?,
        None => filesystem_capacity(&config.base_dir)
            .context("failed to detect capacity of the base directory")?,
    };
    info!(%capacity, "advertising volume capacity");

    let allocator = DirectoryAllocator::recover(&config.base_dir)
        .context("failed to recover allocation state")?;
    info!(latest = allocator.latest(), "recovered allocation state");

    let kube_config = KubeConfig::in_cluster().context("failed to load in-cluster config")?;
    let orchestrator: Arc<dyn OrchestratorClient> =
        Arc::new(KubeClient::new(kube_config).context("failed to build Kubernetes client")?);
    let backend: Arc<dyn QuotaBackend> =
        Arc::new(XfsQuota::new(&config.base_dir).with_binary(&config.quota_binary));
    let metrics = new_shared_registry(&config.node_name).context("failed to register metrics")?;

    let mut reconciler = VolumePoolReconciler::new(
        Arc::clone(&config),
        capacity,
        allocator,
        Arc::clone(&orchestrator),
        Arc::clone(&backend),
        Arc::clone(&metrics),
    );
    let handler: Arc<dyn ClaimUpdateHandler> = Arc::new(QuotaSyncHandler::new(
        Arc::clone(&config),
        Arc::clone(&orchestrator),
        Arc::clone(&backend),
        Arc::clone(&metrics),
    ));
    let mut watcher = ClaimWatcher::new(
        Arc::clone(&orchestrator),
        handler,
        config.resync_interval,
    );
    let mut collector = MetricsCollector::new(
        Arc::clone(&backend),
        Arc::clone(&metrics),
        ProcFs::default(),
        &config.base_dir,
        config.metrics_interval,
    );

    let shutdown_handles = [
        reconciler.shutdown_handle(),
        watcher.shutdown_handle(),
        collector.shutdown_handle(),
    ];

    let reconciler_task = tokio::spawn(async move { reconciler.run().await });
    let watcher_task = tokio::spawn(async move { watcher.run().await });
    let collector_task = tokio::spawn(async move { collector.run().await });

    let metrics_addr = config.metrics_addr;
    info!(addr = %metrics_addr, "starting metrics HTTP server");
    let metrics_task = tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics, metrics_addr).await {
            error!("Metrics server error: {e:#}");
        }
    });

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
        result = reconciler_task => {
            error!(?result, "volume pool reconciler exited");
        }
        result = watcher_task => {
            error!(?result, "claim watcher exited");
        }
        result = collector_task => {
            error!(?result, "metrics collector exited");
        }
        result = metrics_task => {
            error!(?result, "metrics server exited");
        }
    }

    for handle in &shutdown_handles {
        handle.store(true, Ordering::Relaxed);
    }
    info!("quotad stopped");
    Ok(())
}

/// Serves `GET /metrics` in the Prometheus text format on `addr`.
async fn run_metrics_server(metrics_registry: SharedMetricsRegistry, addr: SocketAddr) -> Result<()> {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    let metrics_handler = {
        let registry = Arc::clone(&metrics_registry);
        move || {
            let registry = Arc::clone(&registry);
            async move {
                match registry.encode_text() {
                    Ok(body) => (
                        StatusCode::OK,
                        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                        body,
                    )
                        .into_response(),
                    Err(e) => {
                        error!("Failed to encode metrics: {e}");
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            format!("Failed to encode metrics: {e}"),
                        )
                            .into_response()
                    },
                }
            }
        }
    };

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/", get(|| async { "quotad\n\nGET /metrics - Prometheus metrics endpoint\n" }));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind metrics server")?;

    info!(addr = %addr, "Metrics HTTP server listening");

    axum::serve(listener, app)
        .await
        .context("metrics server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("quotad").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_override_defaults() {
        let args = parse(&[
            "--node-name",
            "node-a",
            "--available-num",
            "3",
            "--list-duration",
            "10s",
            "--storage",
            "50Gi",
        ]);

        let config = args.load_config().unwrap();

        assert_eq!(config.node_name, "node-a");
        assert_eq!(config.available_num, 3);
        assert_eq!(config.list_interval, Duration::from_secs(10));
        assert_eq!(config.storage.as_deref(), Some("50Gi"));
        assert_eq!(config.base_dir, PathBuf::from("/data"));
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("quotad.toml");
        std::fs::write(
            &path,
            "node_name = \"from-file\"\navailable_num = 5\nstorage_class_name = \"fast\"\n",
        )
        .unwrap();

        let args = parse(&[
            "--config",
            path.to_str().unwrap(),
            "--node-name",
            "node-b",
        ]);
        let config = args.load_config().unwrap();

        assert_eq!(config.node_name, "node-b");
        assert_eq!(config.available_num, 5);
        assert_eq!(config.storage_class_name, "fast");
    }

    #[test]
    fn missing_node_name_is_rejected() {
        let args = parse(&["--base-dir", "/srv/volumes"]);
        assert!(args.load_config().is_err());
    }
}
