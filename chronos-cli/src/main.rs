//! Chronos node binary.
//!
//! `chronos start` runs the HTTP server, the callback worker, and a resync
//! task. Resynchronization runs once at start-up and again on `SIGUSR1`;
//! `SIGHUP` reloads the cluster sections of the configuration file, which
//! is how scale events are announced to a running node.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chronos_cli::api::{ApiState, create_router, seed_timer_ids};
use chronos_cli::callback::CallbackWorker;
use chronos_cli::config::AppConfig;
use chronos_core::{
    Clock, ClusterView, HttpBackend, HttpReplicator, InMemoryTimerStore, PeerClient,
    Replicator, RequestBackend, ResyncCoordinator, ResyncStats, SystemClock, TimerStore,
};

/// Distributed, replicated timer service.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter, e.g. `info` or `chronos_core=debug`.
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node.
    Start {
        /// Path to the TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Query a running node's health endpoint.
    Status {
        /// Host the node is bound to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port the node is bound to.
        #[arg(short, long, default_value = "7253")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => {
            let app_config = AppConfig::load(&config)?;
            init_logging(cli.log_level.as_deref().unwrap_or(app_config.logging.level.as_str()));
            start(app_config, config).await
        }
        Commands::Status { host, port } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"));
            status(&host, port).await
        }
    }
}

fn init_logging(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn start(config: AppConfig, config_path: PathBuf) -> Result<()> {
    let snapshot = config.view_snapshot();
    info!(
        local = %snapshot.local,
        view_id = %snapshot.view_id,
        nodes = snapshot.all_current_nodes().len(),
        "starting chronos node"
    );
    let view = Arc::new(ClusterView::new(snapshot).context("building the cluster view")?);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(InMemoryTimerStore::new());
    let backend: Arc<dyn RequestBackend> = Arc::new(HttpBackend::new());
    let replicator: Arc<dyn Replicator> = Arc::new(HttpReplicator::new(
        backend.clone(),
        clock.clone(),
        config.resync.request_timeout,
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // HTTP surface.
    let state = ApiState {
        store: store.clone(),
        view: view.clone(),
        replicator: replicator.clone(),
        clock: clock.clone(),
        replica_factor: config.cluster.effective_replica_factor(),
        max_timers_in_response: config.resync.max_timers_in_response,
        next_timer_id: seed_timer_ids(clock.as_ref(), config.http.bind_port),
    };
    let bind = format!("{}:{}", config.http.bind_address, config.http.bind_port);
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding HTTP listener on {bind}"))?;
    info!(%bind, "http service available");
    let server = {
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            axum::serve(listener, create_router(state))
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await
        })
    };

    // Pop loop.
    let worker = CallbackWorker::new(
        store.clone(),
        replicator.clone(),
        clock.clone(),
        view.local(),
        Duration::from_secs(5),
    )?;
    let worker_handle = worker.spawn(shutdown_rx.clone());

    // Resync task: one trigger slot is enough, runs coalesce.
    let coordinator = Arc::new(ResyncCoordinator::new(
        view.clone(),
        PeerClient::new(backend.clone(), config.resync.clone()),
        store.clone() as Arc<dyn TimerStore>,
        replicator.clone(),
        clock.clone(),
        ResyncStats::default(),
        shutdown_rx.clone(),
    ));
    let (resync_tx, mut resync_rx) = mpsc::channel::<()>(1);
    let _ = resync_tx.try_send(());
    let resync_task = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            while resync_rx.recv().await.is_some() {
                coordinator.resynchronize().await;
            }
        })
    };

    let mut hangup = signal(SignalKind::hangup()).context("installing the SIGHUP handler")?;
    let mut scale = signal(SignalKind::user_defined1()).context("installing the SIGUSR1 handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("termination signal received");
                break;
            }
            _ = hangup.recv() => {
                match AppConfig::load(&config_path) {
                    Ok(reloaded) => {
                        let snapshot = reloaded.view_snapshot();
                        let view_id = snapshot.view_id.clone();
                        match view.apply(snapshot) {
                            Ok(()) => info!(%view_id, "cluster configuration reloaded"),
                            Err(err) => error!("rejected reloaded cluster configuration: {err}"),
                        }
                    }
                    Err(err) => error!("failed to reload configuration: {err:#}"),
                }
            }
            _ = scale.recv() => {
                info!("scale operation triggered");
                if resync_tx.try_send(()).is_err() {
                    warn!("resynchronization already queued");
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    drop(resync_tx);
    let _ = worker_handle.await;
    let _ = resync_task.await;
    server.await.context("joining the HTTP server task")??;
    Ok(())
}

async fn status(host: &str, port: u16) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("building the status HTTP client")?;
    let url = format!("http://{host}:{port}/health");
    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("querying {url}"))?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    println!("node:            {host}:{port}");
    println!("http status:     {status}");
    if let Some(view_id) = body.get("cluster-view-id").and_then(serde_json::Value::as_str) {
        println!("cluster view:    {view_id}");
    }
    if let Some(timers) = body.get("timers").and_then(serde_json::Value::as_u64) {
        println!("timers held:     {timers}");
    }
    Ok(())
}
