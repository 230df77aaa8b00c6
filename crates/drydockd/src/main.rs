//! drydockd — the Drydock daemon.
//!
//! Single binary that assembles the deployment engine:
//! - App registry + redb history store
//! - Git source fetcher
//! - Docker container engine + port allocator
//! - Nginx proxy synchronizer
//! - Secrets provider (env-file or exec backend)
//! - Deployment orchestrator
//! - Healer daemon
//! - REST API + Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! drydockd --port 7070 --data-dir /var/lib/drydock
//! drydockd --config /etc/drydock/drydock.toml
//! ```

mod settings;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use drydock_api::{ApiState, build_router};
use drydock_engine::{DockerEngine, PortAllocator};
use drydock_healer::Healer;
use drydock_metrics::Metrics;
use drydock_orchestrator::Orchestrator;
use drydock_proxy::NginxProxy;
use drydock_secrets::{EnvFileProvider, ExecProvider, SecretsProvider};
use drydock_source::GitFetcher;
use drydock_state::{AppRegistry, HistoryStore};

use settings::{SecretsSettings, Settings};

#[derive(Parser)]
#[command(name = "drydockd", about = "Drydock deployment daemon")]
struct Cli {
    /// TOML settings file; flags below override it.
    #[arg(long, env = "DRYDOCK_CONFIG")]
    config: Option<PathBuf>,

    /// API listen port.
    #[arg(long, env = "DRYDOCK_PORT")]
    port: Option<u16>,

    /// Data directory for persistent state.
    #[arg(long, env = "DRYDOCK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Directory for cached app clones.
    #[arg(long, env = "DRYDOCK_REPOS_DIR")]
    repos_dir: Option<PathBuf>,

    /// Domain suffix apps are routed under ({app}.{suffix}).
    #[arg(long, env = "DRYDOCK_DOMAIN_SUFFIX")]
    domain_suffix: Option<String>,

    /// Healer cycle interval in seconds.
    #[arg(long, env = "DRYDOCK_HEALER_INTERVAL")]
    healer_interval: Option<u64>,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if let Some(port) = self.port {
            settings.listen_port = port;
        }
        if let Some(dir) = &self.data_dir {
            settings.data_dir = dir.clone();
        }
        if let Some(dir) = &self.repos_dir {
            settings.repos_dir = dir.clone();
        }
        if let Some(suffix) = &self.domain_suffix {
            settings.domain_suffix = suffix.clone();
        }
        if let Some(interval) = self.healer_interval {
            settings.healer_interval_secs = interval;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,drydockd=debug,drydock=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    cli.apply(&mut settings);

    run(settings).await
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    info!("drydock daemon starting");

    std::fs::create_dir_all(&settings.data_dir)?;
    let db_path = settings.data_dir.join("drydock.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let history = HistoryStore::open(&db_path)?;
    info!(path = ?db_path, "history store opened");

    let registry = Arc::new(AppRegistry::new());
    let metrics = Arc::new(Metrics::new());

    let source = Arc::new(GitFetcher::new(
        &settings.repos_dir,
        settings.command_timeout(),
    ));
    let engine = Arc::new(DockerEngine::new(
        settings.command_timeout(),
        settings.build_timeout(),
    ));
    let proxy = Arc::new(NginxProxy::new(
        &settings.sites_dir,
        &settings.domain_suffix,
        settings.proxy_check_cmd.clone(),
        settings.proxy_reload_cmd.clone(),
        settings.command_timeout(),
    ));
    let secrets: Arc<dyn SecretsProvider> = match &settings.secrets {
        SecretsSettings::EnvFile { path } => Arc::new(EnvFileProvider::load(path)?),
        SecretsSettings::Exec { command } => {
            Arc::new(ExecProvider::new(command.clone(), settings.command_timeout())?)
        }
    };
    let ports = Arc::new(PortAllocator::new(
        settings.port_range_start,
        settings.port_range_end,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        history.clone(),
        source,
        engine.clone(),
        proxy,
        secrets,
        ports,
        metrics.clone(),
        settings.orchestrator_config(),
    ));
    info!("orchestrator initialized");

    // Rebuild the registry from the store: apps survive daemon restarts,
    // and the healer repairs whatever broke while we were down.
    let recovered = orchestrator.recover().await?;
    info!(apps = recovered, "state recovered");

    let healer = Healer::new(
        registry.clone(),
        engine,
        orchestrator.clone(),
        metrics.clone(),
        settings.healer_config(),
    );
    info!(interval = settings.healer_interval_secs, "healer initialized");

    // ── Start background tasks ─────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let healer_handle = tokio::spawn(async move {
        healer.run(shutdown_rx).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = build_router(ApiState {
        registry,
        history,
        deployer: orchestrator,
        metrics,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.listen_port));

    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = healer_handle.await;

    info!("drydock daemon stopped");
    Ok(())
}
