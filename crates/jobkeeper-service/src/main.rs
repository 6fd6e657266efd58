use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use jobkeeper_core::config::{JobkeeperConfig, StorageBackend};
use jobkeeper_scheduler::{
    HttpJobExecutor, JobRepository, JobScheduler, JobStatusEvent, LeaderElector,
    MemoryJobRepository, SqliteJobRepository,
};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

mod app;
mod http;

/// Clustered job scheduler: accepts jobs on every instance, dispatches them
/// from the elected leader.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config file (falls back to JOBKEEPER_CONFIG, then
    /// ~/.jobkeeper/jobkeeper.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Keep jobs and the lease in process memory instead of SQLite
    #[arg(long)]
    memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "jobkeeper_service=info,jobkeeper_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let args = Args::parse();

    // load config: --config > JOBKEEPER_CONFIG env > ~/.jobkeeper/jobkeeper.toml
    let config_path = args.config.or_else(|| std::env::var("JOBKEEPER_CONFIG").ok());
    let mut config = JobkeeperConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        JobkeeperConfig::default()
    });
    if let Some(port) = args.port {
        config.service.port = port;
    }
    if args.memory {
        config.database.backend = StorageBackend::Memory;
    }

    let repo = open_repository(&config)?;

    let executor = HttpJobExecutor::new(
        &config.http,
        Duration::from_millis(config.scheduler.default_execution_timeout_ms),
    )?;

    let elector = LeaderElector::new(Arc::clone(&repo), &config.scheduler);
    let instance = elector.token().to_string();
    info!(%instance, lease = %config.scheduler.lease_id, "instance identity");

    // Status events: scheduler (leader only) → logging consumer
    let (status_tx, status_rx) = mpsc::channel::<JobStatusEvent>(256);
    tokio::spawn(log_status_events(status_rx));

    let scheduler = JobScheduler::new(
        Arc::clone(&repo),
        Arc::new(executor),
        config.scheduler.clone(),
        elector.subscribe(),
    )
    .with_status_sink(status_tx);

    let state = Arc::new(app::AppState::new(
        config,
        scheduler.clone(),
        elector.subscribe(),
        instance,
    ));
    let router = app::build_router(Arc::clone(&state));

    // background loops share one shutdown broadcast
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let elector_task = tokio::spawn(elector.run(shutdown_rx.clone()));
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    let addr: SocketAddr =
        format!("{}:{}", state.config.service.bind, state.config.service.port).parse()?;
    info!("Jobkeeper listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // stop dispatching, then give the lease up so another instance takes over at once
    let _ = shutdown_tx.send(true);
    let _ = scheduler_task.await;
    let _ = elector_task.await;
    info!("Jobkeeper stopped");
    Ok(())
}

fn open_repository(config: &JobkeeperConfig) -> anyhow::Result<Arc<dyn JobRepository>> {
    match config.database.backend {
        StorageBackend::Memory => {
            warn!("in-memory storage: jobs are lost on exit and not shared between instances");
            Ok(Arc::new(MemoryJobRepository::new()))
        }
        StorageBackend::Sqlite => {
            let db_path = &config.database.path;
            ensure_parent_dir(db_path);
            info!(path = %db_path, "opening SQLite database");
            Ok(Arc::new(SqliteJobRepository::open(db_path)?))
        }
    }
}

/// Drains status events. Recipients of these notifications would hang off
/// this loop; for now each change is logged.
async fn log_status_events(mut rx: mpsc::Receiver<JobStatusEvent>) {
    while let Some(event) = rx.recv().await {
        info!(
            job_id = %event.job_id,
            correlation_id = %event.correlation_id,
            status = %event.status,
            attempt = event.execution_counter,
            "job status changed"
        );
    }
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

/// Resolves on SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm => {}
    }
    info!("shutdown signal received");
}
