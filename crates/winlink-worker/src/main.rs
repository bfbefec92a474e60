//! WinLink Worker Daemon

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use winlink_core::{WorkerId, WorkerInfo};
use winlink_proto::{MessageAuthenticator, TlsIdentity};

mod beacon;
mod config;
mod connection;
mod executor;
mod isolation;
mod templates;
mod usage;

use config::{BackendKind, WorkerConfig};
use connection::ConnectionManager;
use executor::Executor;

/// Updates waiting for the master while it is unreachable.
const OUTBOUND_CAPACITY: usize = 1024;

/// Time running tasks get to report cancellation on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// WinLink worker - executes tasks dispatched by a master
#[derive(Parser)]
#[command(name = "winlink-worker")]
#[command(about = "Execution node for a WinLink cluster", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Master address (host:port)
    #[arg(short, long)]
    master: Option<String>,

    /// Name the master certificate is issued for
    #[arg(long)]
    server_name: Option<String>,

    /// Worker ID (must match the certificate CN `worker:<id>`)
    #[arg(long)]
    worker_id: Option<String>,

    /// Isolation backend
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Maximum concurrent tasks
    #[arg(long)]
    max_tasks: Option<u32>,

    /// Disable the discovery beacon
    #[arg(long)]
    no_beacon: bool,
}

impl Args {
    fn apply(self, config: &mut WorkerConfig) {
        if let Some(master) = self.master {
            config.master_addr = master;
        }
        if let Some(name) = self.server_name {
            config.server_name = name;
        }
        if let Some(id) = self.worker_id {
            config.worker_id = WorkerId::new(id);
        }
        if let Some(backend) = self.backend {
            config.isolation.backend = backend;
        }
        if let Some(max_tasks) = self.max_tasks {
            config.capacity.max_tasks = max_tasks;
        }
        if self.no_beacon {
            config.beacon.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    let mut config = WorkerConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    let identity = TlsIdentity::load(&config.tls).await.map_err(|e| {
        format!("{}. Provision the CA, worker certificate and key first.", e)
    })?;
    let auth = MessageAuthenticator::from_file(&config.secret_path)
        .await
        .map_err(|e| {
            format!(
                "Failed to load shared secret from '{}': {}",
                config.secret_path.display(),
                e
            )
        })?;

    let provider = isolation::from_config(&config.isolation);
    info!(
        worker_id = %config.worker_id,
        master = %config.master_addr,
        backend = provider.name(),
        max_tasks = config.capacity.max_tasks,
        "Starting WinLink worker"
    );

    let shutdown = CancellationToken::new();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let executor = Arc::new(Executor::new(&config, provider, outbound_tx));

    if config.beacon.enabled {
        spawn_beacon(&config, shutdown.clone()).await;
    }

    let manager = ConnectionManager::new(
        &config,
        identity.connector()?,
        Arc::new(auth),
        executor.clone(),
    );
    let connection_shutdown = CancellationToken::new();
    let mut connection = tokio::spawn(manager.run(outbound_rx, connection_shutdown.clone()));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown requested");
        }
        result = &mut connection => {
            if let Err(e) = result {
                error!(error = %e, "Connection manager panicked");
            }
            shutdown.cancel();
            return Ok(());
        }
    }

    // Let cancellations of running tasks reach the master before disconnecting.
    shutdown.cancel();
    executor.cancel_all("worker shutting down").await;
    for _ in 0..(SHUTDOWN_GRACE.as_millis() / 100) {
        if executor.active_tasks().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    connection_shutdown.cancel();
    if let Err(e) = connection.await {
        error!(error = %e, "Connection manager panicked");
    }

    info!("Worker stopped");
    Ok(())
}

async fn spawn_beacon(config: &WorkerConfig, shutdown: CancellationToken) {
    let target: SocketAddr = match config.beacon.target.parse() {
        Ok(target) => target,
        Err(e) => {
            warn!(target = %config.beacon.target, error = %e, "Invalid beacon target, beacon disabled");
            return;
        }
    };
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "Could not open beacon socket, beacon disabled");
            return;
        }
    };
    let info = WorkerInfo::new(config.worker_id.clone(), config.hostname())
        .with_address(config.advertise_addr.clone())
        .with_capacity(config.capacity);
    tokio::spawn(beacon::broadcast(
        socket,
        target,
        info,
        config.beacon_interval(),
        shutdown,
    ));
}
