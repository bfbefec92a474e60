//! WinLink Master Server

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use winlink_master::{
    HistoryStore, JsonlHistoryStore, MasterConfig, MemoryHistoryStore, StrategyKind,
};
use winlink_proto::{MessageAuthenticator, TlsIdentity};

/// WinLink master - distributes tasks to connected workers
#[derive(Parser)]
#[command(name = "winlink-master")]
#[command(about = "Task registry and scheduler for a WinLink cluster", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Scheduling strategy
    #[arg(short, long, value_enum)]
    strategy: Option<StrategyKind>,

    /// Host to accept worker connections on
    #[arg(long)]
    listen_host: Option<String>,

    /// First port of the worker listener range
    #[arg(long)]
    port_start: Option<u16>,

    /// Last port of the worker listener range
    #[arg(long)]
    port_end: Option<u16>,

    /// HTTP admin address
    #[arg(long)]
    http_addr: Option<String>,

    /// History file (JSON lines)
    #[arg(long)]
    history: Option<PathBuf>,

    /// Keep history in memory only
    #[arg(long, conflicts_with = "history")]
    no_history: bool,

    /// Disable the discovery beacon listener
    #[arg(long)]
    no_discovery: bool,

    /// Print a fresh shared secret and exit
    #[arg(long)]
    generate_secret: bool,
}

impl Args {
    fn apply(self, config: &mut MasterConfig) {
        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }
        if let Some(host) = self.listen_host {
            config.listen_host = host;
        }
        if let Some(start) = self.port_start {
            config.port_range_start = start;
        }
        if let Some(end) = self.port_end {
            config.port_range_end = end;
        }
        if let Some(addr) = self.http_addr {
            config.http_addr = Some(addr);
        }
        if let Some(history) = self.history {
            config.history_path = Some(history);
        }
        if self.no_history {
            config.history_path = None;
        }
        if self.no_discovery {
            config.discovery_enabled = false;
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
    if args.generate_secret {
        println!("{}", MessageAuthenticator::generate_secret());
        return Ok(());
    }

    let mut config = MasterConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    let identity = TlsIdentity::load(&config.tls).await.map_err(|e| {
        format!("{}. Provision the CA, master certificate and key first.", e)
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

    let store: Arc<dyn HistoryStore> = match &config.history_path {
        Some(path) => Arc::new(JsonlHistoryStore::new(path)),
        None => Arc::new(MemoryHistoryStore::new()),
    };

    info!(
        strategy = ?config.strategy,
        listen_host = %config.listen_host,
        ports = %format!("{}-{}", config.port_range_start, config.port_range_end),
        "Starting WinLink master"
    );

    let handle = winlink_master::start(config, identity, Arc::new(auth), store).await?;
    info!(addr = %handle.local_addr, "Master ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    handle.shutdown().await;

    Ok(())
}
