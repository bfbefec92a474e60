//! WinLink Master Library
//!
//! This crate provides the master node: the task registry, the live worker
//! set, the scheduler and its dispatch strategies, worker connection
//! sessions, liveness monitoring, discovery, history persistence and the
//! HTTP admin surface.

pub mod config;
pub mod discovery;
pub mod http;
pub mod metrics;
pub mod monitor;
pub mod persistence;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod strategy;
pub mod workers;

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use winlink_proto::socket::bind_in_range;
use winlink_proto::{MessageAuthenticator, TlsError, TlsIdentity, TransportError};

pub use config::{ConfigError, MasterConfig};
pub use persistence::{
    HistoryStore, JsonlHistoryStore, MemoryHistoryStore, PersistenceError, PruneReport, UsageRecord,
};
pub use registry::TaskRegistry;
pub use scheduler::Scheduler;
pub use state::MasterState;
pub use strategy::StrategyKind;

/// Errors that prevent the master from starting.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Failed to bind HTTP listener on {addr}: {source}")]
    HttpBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// A running master.
pub struct MasterHandle {
    pub state: Arc<MasterState>,
    /// Address workers connect to.
    pub local_addr: SocketAddr,
    pub http_addr: Option<SocketAddr>,
    pub discovery_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MasterHandle {
    /// Token that stops every master loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop all loops and wait for them, letting the recorder flush.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Master task panicked");
            }
        }
        info!("Master stopped");
    }
}

/// Start the master: restore history, bind the worker listener and spawn
/// the scheduler, monitor, recorder, discovery listener and HTTP server.
pub async fn start(
    config: MasterConfig,
    identity: TlsIdentity,
    auth: Arc<MessageAuthenticator>,
    store: Arc<dyn HistoryStore>,
) -> Result<MasterHandle, StartError> {
    config.validate()?;
    let acceptor = identity.acceptor()?;

    let pending = persistence::reload(store.as_ref()).await?;

    // Everything that can fail happens before the first spawn.
    let listener = bind_in_range(
        &config.listen_host,
        config.port_range_start,
        config.port_range_end,
    )
    .await?;
    let local_addr = listener.local_addr().map_err(TransportError::from)?;
    let http_listener = match &config.http_addr {
        Some(addr) => Some(TcpListener::bind(addr).await.map_err(|source| {
            StartError::HttpBind {
                addr: addr.clone(),
                source,
            }
        })?),
        None => None,
    };

    let (journal_tx, journal_rx) = mpsc::unbounded_channel();
    let (usage_tx, usage_rx) = mpsc::unbounded_channel();
    let state = MasterState::with_history(
        config,
        TaskRegistry::new().with_journal(journal_tx),
        store.clone(),
        usage_tx,
    );
    let config = &state.config;

    let restored = state.registry.restore(pending).await;
    if restored > 0 {
        info!(restored, "Restored unfinished tasks from history");
    }

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    let recorder = persistence::Recorder::new(
        store,
        state.registry.clone(),
        config.persistence_retry.clone(),
    )
    .with_intermediate(config.record_intermediate)
    .with_retain_terminal(config.retain_terminal)
    .with_usage(usage_rx)
    .with_retention(config.history_retention());
    tasks.push(tokio::spawn(recorder.run(journal_rx, shutdown.clone())));

    info!(addr = %local_addr, "Accepting worker connections (TLS)");
    tasks.push(tokio::spawn(server::serve(
        listener,
        acceptor,
        auth,
        state.clone(),
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(
        state
            .scheduler
            .clone()
            .run(config.schedule_interval(), shutdown.clone()),
    ));
    tasks.push(tokio::spawn(monitor::run(state.clone(), shutdown.clone())));

    let mut discovery_addr = None;
    if config.discovery_enabled {
        match UdpSocket::bind((config.listen_host.as_str(), config.discovery_port)).await {
            Ok(socket) => {
                discovery_addr = socket.local_addr().ok();
                tasks.push(tokio::spawn(discovery::listen(
                    socket,
                    state.discovered.clone(),
                    config.discovery_stale(),
                    shutdown.clone(),
                )));
            }
            Err(e) => warn!(
                port = config.discovery_port,
                error = %e,
                "Discovery listener unavailable, continuing without it"
            ),
        }
    }

    let mut http_addr = None;
    if let Some(http_listener) = http_listener {
        http_addr = http_listener.local_addr().ok();
        info!(addr = ?http_addr, "HTTP admin server listening");

        let router = http::create_router(state.clone());
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let result = axum::serve(http_listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }));
    }

    Ok(MasterHandle {
        state,
        local_addr,
        http_addr,
        discovery_addr,
        shutdown,
        tasks,
    })
}
