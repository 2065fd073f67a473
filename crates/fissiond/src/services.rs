//! Wiring of the components behind each subcommand.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use fission_client::ExecutorClient;
use fission_core::FissionConfig;
use fission_executor::Executor;
use fission_orchestrator::{InMemoryOrchestrator, Orchestrator};
use fission_state::StateStore;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

const CATALOG_FILE: &str = "fission.redb";

/// Configuration, catalog and orchestrator shared by the components of one
/// process.
pub struct Daemon {
    pub config: FissionConfig,
    pub store: StateStore,
    pub orchestrator: Arc<dyn Orchestrator>,
}

impl Daemon {
    pub fn open(config: Option<&Path>, data_dir: Option<&Path>, pod_ip: Option<&str>) -> anyhow::Result<Self> {
        let config = FissionConfig::load(config)?;

        let store = match data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let path = dir.join(CATALOG_FILE);
                let store = StateStore::open(&path)?;
                info!(path = ?path, "catalog opened");
                store
            }
            None => {
                info!("using an in-memory catalog");
                StateStore::open_in_memory()?
            }
        };

        let mut orchestrator = InMemoryOrchestrator::new();
        if let Some(ip) = pod_ip {
            orchestrator = orchestrator.with_pod_ip(ip);
        }

        Ok(Self {
            config,
            store,
            orchestrator: Arc::new(orchestrator),
        })
    }

    async fn start_executor(&self) -> anyhow::Result<Arc<Executor>> {
        let executor = Arc::new(Executor::new(
            self.store.clone(),
            self.orchestrator.clone(),
            self.config.executor.clone(),
        ));
        executor.start().await?;
        Ok(executor)
    }

    fn start_router(&self, executor_url: &str) -> anyhow::Result<Router> {
        let mut config = self.config.router.clone();
        config.executor_url = executor_url.to_string();
        let client = ExecutorClient::with_tap_interval(&config.executor_url, config.tap_interval);
        let (app, _triggers) = fission_router::start(self.store.clone(), config, Arc::new(client))?;
        Ok(app)
    }

    fn start_buildermgr(&self) -> anyhow::Result<()> {
        fission_buildermgr::start(
            self.store.clone(),
            self.orchestrator.clone(),
            self.config.builder.clone(),
        )?;
        info!(namespace = %self.config.builder.builder_namespace, "builder manager started");
        Ok(())
    }
}

// ── Subcommands ────────────────────────────────────────────────────

pub async fn run_executor(daemon: Daemon, port: u16) -> anyhow::Result<()> {
    let executor = daemon.start_executor().await?;
    let listener = bind(port).await?;
    info!(addr = %listener.local_addr()?, "executor API listening");
    serve(listener, fission_executor::build_router(executor), shutdown_signal()).await?;
    info!("executor stopped");
    Ok(())
}

pub async fn run_router(daemon: Daemon, port: u16) -> anyhow::Result<()> {
    let executor_url = daemon.config.router.executor_url.clone();
    let app = daemon.start_router(&executor_url)?;
    let listener = bind(port).await?;
    info!(addr = %listener.local_addr()?, %executor_url, "router listening");
    serve(listener, app, shutdown_signal()).await?;
    info!("router stopped");
    Ok(())
}

pub async fn run_buildermgr(daemon: Daemon) -> anyhow::Result<()> {
    daemon.start_buildermgr()?;
    shutdown_signal().await;
    info!("builder manager stopped");
    Ok(())
}

pub async fn run_standalone(daemon: Daemon, router_port: u16, executor_port: u16) -> anyhow::Result<()> {
    info!("fission daemon starting in standalone mode");

    let executor = daemon.start_executor().await?;
    let executor_listener = bind(executor_port).await?;
    let executor_addr = executor_listener.local_addr()?;
    let executor_url = format!("http://127.0.0.1:{}", executor_addr.port());
    info!(addr = %executor_addr, "executor API listening");

    let app = daemon.start_router(&executor_url)?;
    daemon.start_buildermgr()?;

    // ── Shutdown signal ────────────────────────────────────────────

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let executor_server = tokio::spawn(serve(
        executor_listener,
        fission_executor::build_router(executor),
        async move {
            let _ = stop_rx.wait_for(|stop| *stop).await;
        },
    ));

    let router_listener = bind(router_port).await?;
    info!(addr = %router_listener.local_addr()?, "router listening");
    serve(router_listener, app, async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    })
    .await?;

    match executor_server.await {
        Ok(result) => result?,
        Err(e) => warn!(error = %e, "executor server task failed"),
    }
    info!("fission daemon stopped");
    Ok(())
}

// ── Serving ────────────────────────────────────────────────────────

async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    Ok(TcpListener::bind(addr).await?)
}

async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => {
            warn!(error = %e, "cannot listen for ctrl-c, running until killed");
            std::future::pending::<()>().await;
        }
    }
}
