//! Connection to the master.
//!
//! The manager registers with the master, then runs a session that relays
//! inbound commands to the executor, sends heartbeats and drains the
//! outbound queue. When the session ends it reconnects, re-registering with
//! the tasks this worker still owns.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use winlink_core::{WorkerCapacity, WorkerId, WorkerInfo};
use winlink_proto::{
    connect, Ack, ConnectOptions, Connection, ConnectionWriter, Heartbeat, Message,
    MessageAuthenticator, MessageKind, Register, TransportError,
};

use crate::config::WorkerConfig;
use crate::executor::Executor;
use crate::usage::UsageSampler;

/// Why a session stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// Shutdown was requested or the outbound queue closed.
    Shutdown,
    /// The master went away; reconnect.
    Lost(String),
}

/// Timing and identity used by a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub worker_id: WorkerId,
    pub capacity: WorkerCapacity,
    pub heartbeat_interval: Duration,
    /// Silence after which the master is considered lost.
    pub master_timeout: Duration,
    /// Source of the usage sample attached to each heartbeat.
    pub usage: Option<Arc<UsageSampler>>,
}

impl SessionSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            capacity: config.capacity,
            heartbeat_interval: config.heartbeat_interval(),
            master_timeout: config.master_timeout(),
            usage: config
                .report_usage
                .then(|| Arc::new(UsageSampler::new())),
        }
    }
}

/// Keeps the worker connected to its master.
pub struct ConnectionManager {
    info: WorkerInfo,
    options: ConnectOptions,
    connector: TlsConnector,
    auth: Arc<MessageAuthenticator>,
    executor: Arc<Executor>,
    settings: SessionSettings,
    reconnect_delay: Duration,
}

impl ConnectionManager {
    pub fn new(
        config: &WorkerConfig,
        connector: TlsConnector,
        auth: Arc<MessageAuthenticator>,
        executor: Arc<Executor>,
    ) -> Self {
        let info = WorkerInfo::new(config.worker_id.clone(), config.hostname())
            .with_address(config.advertise_addr.clone())
            .with_capacity(config.capacity);

        let options = ConnectOptions::new(config.master_addr.clone(), config.server_name.clone())
            .with_retry(config.connect_retry.clone());

        Self {
            info,
            options,
            connector,
            auth,
            executor,
            settings: SessionSettings::from_config(config),
            reconnect_delay: config.reconnect_delay(),
        }
    }

    /// Connect, run sessions and reconnect until shutdown.
    ///
    /// `outbound` carries task updates from the executor; it outlives
    /// individual connections so updates produced while disconnected are
    /// delivered after the next registration.
    pub async fn run(self, mut outbound: mpsc::Receiver<Message>, shutdown: CancellationToken) {
        let mut pending: Option<Message> = None;

        loop {
            let register = Register::new(&self.info, self.executor.active_tasks().await);
            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = connect(&self.options, &self.connector, self.auth.clone(), &register) => result,
            };

            match connected {
                Ok(conn) => {
                    info!(
                        master = %self.options.address,
                        active_tasks = register.active_tasks.len(),
                        "Connected to master"
                    );
                    let end = run_session(
                        conn,
                        &self.settings,
                        &self.executor,
                        &mut outbound,
                        &mut pending,
                        &shutdown,
                    )
                    .await;
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => {
                            warn!(master = %self.options.address, reason = %reason, "Lost connection to master")
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Could not reach master"),
            }

            info!(
                delay_secs = self.reconnect_delay.as_secs(),
                "Reconnecting to master"
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        info!("Connection manager stopped");
    }
}

/// Serve one registered connection until it is lost or shutdown is requested.
///
/// A message that could not be written is left in `pending` and sent first
/// on the next session.
pub async fn run_session<S>(
    conn: Connection<S>,
    settings: &SessionSettings,
    executor: &Arc<Executor>,
    outbound: &mut mpsc::Receiver<Message>,
    pending: &mut Option<Message>,
    shutdown: &CancellationToken,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut writer, mut reader) = conn.into_split();

    if let Some(message) = pending.take() {
        if let Err(e) = deliver(&mut writer, message, executor, pending).await {
            return SessionEnd::Lost(e.to_string());
        }
    }

    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + settings.heartbeat_interval,
        settings.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_heard = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = writer.close().await;
                return SessionEnd::Shutdown;
            }

            received = reader.receive() => match received {
                Ok(Some(message)) => {
                    last_heard = Instant::now();
                    if let Some(reply) = handle_message(message, executor).await {
                        if let Err(e) = writer.send(&reply).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                }
                Ok(None) => return SessionEnd::Lost("master closed the connection".to_string()),
                Err(e) => return SessionEnd::Lost(e.to_string()),
            },

            _ = heartbeat.tick() => {
                if last_heard.elapsed() >= settings.master_timeout {
                    return SessionEnd::Lost(format!(
                        "no message from master for {}ms",
                        last_heard.elapsed().as_millis()
                    ));
                }
                let load = executor.load().await;
                let beat = Message::Heartbeat(Heartbeat {
                    worker_id: settings.worker_id.clone(),
                    timestamp: Utc::now(),
                    load,
                    capacity: settings.capacity,
                    usage: settings.usage.as_ref().and_then(|sampler| sampler.sample(load)),
                });
                if let Err(e) = writer.send(&beat).await {
                    return SessionEnd::Lost(e.to_string());
                }
            }

            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(e) = deliver(&mut writer, message, executor, pending).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }
                None => return SessionEnd::Shutdown,
            },
        }
    }
}

/// Write an outbound message; a delivered terminal update releases the task.
async fn deliver<S>(
    writer: &mut ConnectionWriter<S>,
    message: Message,
    executor: &Executor,
    pending: &mut Option<Message>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = writer.send(&message).await {
        *pending = Some(message);
        return Err(e);
    }
    if let Message::TaskUpdate(update) = &message {
        if update.status.is_terminal() {
            executor.reported(&update.task_id).await;
        }
    }
    Ok(())
}

async fn handle_message(message: Message, executor: &Arc<Executor>) -> Option<Message> {
    match message {
        Message::TaskSubmit(submit) => {
            let task_id = submit.task_id.clone();
            debug!(task_id = %task_id, "Received task");
            executor.submit(submit).await;
            Some(Message::Ack(Ack::ok(MessageKind::TaskSubmit, task_id.as_str())))
        }
        Message::Cancel(cancel) => {
            executor.cancel(&cancel.task_id, &cancel.reason).await;
            Some(Message::Ack(Ack::ok(MessageKind::Cancel, cancel.task_id.as_str())))
        }
        Message::Ack(ack) => {
            if ack.ok {
                debug!(ref_kind = %ack.ref_kind, ref_id = %ack.ref_id, "Ack from master");
            } else {
                warn!(
                    ref_kind = %ack.ref_kind,
                    ref_id = %ack.ref_id,
                    detail = ack.detail.as_deref().unwrap_or(""),
                    "Master rejected message"
                );
            }
            None
        }
        other => {
            warn!(kind = %other.kind(), "Unexpected message from master");
            None
        }
    }
}
