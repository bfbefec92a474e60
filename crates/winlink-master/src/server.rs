//! Worker connection handling.
//!
//! One session task per accepted connection: TLS handshake, registration,
//! then a loop relaying inbound heartbeats and task updates to the registry
//! and writing outbound messages queued by the scheduler.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use winlink_core::{validate_worker_id_format, TaskError, WorkerId, WorkerInfo};
use winlink_proto::tls::peer_worker_id;
use winlink_proto::{
    Ack, Connection, Heartbeat, Message, MessageAuthenticator, MessageKind, Register,
    TaskUpdateMsg, TransportError,
};

use crate::metrics::Counters;
use crate::state::MasterState;
use crate::workers::Outbound;

/// Outbound queue depth per worker.
const OUTBOUND_CAPACITY: usize = 64;

/// Session errors. None of these are fatal to the master.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("No registration within the allowed time")]
    RegisterTimeout,

    #[error("Registration rejected: {0}")]
    Rejected(String),
}

/// Accept worker connections until `shutdown`.
pub async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    auth: Arc<MessageAuthenticator>,
    state: Arc<MasterState>,
    shutdown: CancellationToken,
) {
    loop {
        let (tcp, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let auth = auth.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = handle_connection(tcp, peer, acceptor, auth, state) => {
                    if let Err(e) = result {
                        warn!(peer = %peer, error = %e, "Worker session ended with error");
                    }
                }
            }
        });
    }
    info!("Worker listener stopped");
}

async fn handle_connection(
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    auth: Arc<MessageAuthenticator>,
    state: Arc<MasterState>,
) -> Result<(), SessionError> {
    tcp.set_nodelay(true).ok();

    let tls = tokio::time::timeout(state.config.register_timeout(), acceptor.accept(tcp))
        .await
        .map_err(|_| SessionError::Handshake("timed out".to_string()))?
        .map_err(|e| SessionError::Handshake(e.to_string()))?;

    let cert_id = peer_worker_id(tls.get_ref().1.peer_certificates());
    debug!(peer = %peer, cert_worker_id = ?cert_id, "TLS handshake complete");

    let conn = Connection::new(tls, auth, peer.to_string())
        .with_max_auth_failures(state.config.max_auth_failures);
    run_session(conn, cert_id, &state).await
}

/// Check a registration against the id format and, when the client
/// certificate names a worker, against that id.
pub fn check_registration(register: &Register, cert_id: Option<&WorkerId>) -> Result<(), String> {
    validate_worker_id_format(register.worker_id.as_str())?;
    match cert_id {
        Some(cert_id) if cert_id != &register.worker_id => Err(format!(
            "certificate is issued to worker {}, not {}",
            cert_id, register.worker_id
        )),
        _ => Ok(()),
    }
}

/// Drive one worker connection from registration to disconnect.
pub async fn run_session<S>(
    mut conn: Connection<S>,
    cert_id: Option<WorkerId>,
    state: &MasterState,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let register = match tokio::time::timeout(state.config.register_timeout(), conn.receive()).await {
        Err(_) => return Err(SessionError::RegisterTimeout),
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(None)) => return Ok(()),
        Ok(Ok(Some(Message::Register(register)))) => register,
        Ok(Ok(Some(other))) => {
            let kind = other.kind();
            let reason = format!("expected register, got {}", kind);
            conn.send(&Message::Ack(Ack::rejected(kind, "", reason.clone())))
                .await
                .ok();
            return Err(SessionError::Rejected(reason));
        }
    };

    if let Err(reason) = check_registration(&register, cert_id.as_ref()) {
        Counters::incr(&state.counters.rejected_registrations);
        warn!(
            peer = %conn.peer(),
            worker_id = %register.worker_id,
            reason = %reason,
            "Rejecting worker registration"
        );
        conn.send(&Message::Ack(Ack::rejected(
            MessageKind::Register,
            register.worker_id.as_str(),
            reason.clone(),
        )))
        .await
        .ok();
        return Err(SessionError::Rejected(reason));
    }

    let info = WorkerInfo::from(&register);
    let worker_id = info.worker_id.clone();
    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let registration = state
        .workers
        .register(info, tx, &register.active_tasks)
        .await;

    let result = async {
        conn.send(&Message::Ack(Ack::ok(MessageKind::Register, worker_id.as_str())))
            .await?;
        state.requeue_from(&worker_id, &registration.orphaned).await;
        state.scheduler.trigger();
        relay(conn, &worker_id, registration.session, rx, state).await
    }
    .await;

    state
        .workers
        .mark_disconnected(&worker_id, registration.session)
        .await;

    if let Err(SessionError::Transport(TransportError::AuthViolations(n))) = &result {
        Counters::incr(&state.counters.dropped_connections);
        error!(worker_id = %worker_id, violations = n, "Closing connection after repeated authentication failures");
    }
    result
}

async fn relay<S>(
    conn: Connection<S>,
    worker_id: &WorkerId,
    session: u64,
    mut outbound: mpsc::Receiver<Outbound>,
    state: &MasterState,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut writer, mut reader) = conn.into_split();

    loop {
        tokio::select! {
            inbound = reader.receive() => match inbound? {
                Some(message) => {
                    if let Some(reply) = handle_message(message, worker_id, session, state).await {
                        writer.send(&reply).await?;
                    }
                }
                None => {
                    info!(worker_id = %worker_id, "Worker closed connection");
                    return Ok(());
                }
            },
            queued = outbound.recv() => match queued {
                Some(Outbound { message, done }) => {
                    // The scheduler gave up waiting; the task is still queued.
                    if done.as_ref().is_some_and(|d| d.is_closed()) {
                        debug!(worker_id = %worker_id, kind = %message.kind(), "Dropping abandoned message");
                        continue;
                    }
                    match writer.send(&message).await {
                        Ok(()) => {
                            if let Some(done) = done {
                                let _ = done.send(Ok(()));
                            }
                        }
                        Err(e) => {
                            let reason = e.to_string();
                            if let Some(done) = done {
                                let _ = done.send(Err(e));
                            }
                            return Err(TransportError::Disconnected(reason).into());
                        }
                    }
                }
                None => {
                    info!(worker_id = %worker_id, "Worker session superseded or expired");
                    writer.close().await.ok();
                    return Ok(());
                }
            },
        }
    }
}

async fn handle_message(
    message: Message,
    worker_id: &WorkerId,
    session: u64,
    state: &MasterState,
) -> Option<Message> {
    match message {
        Message::Heartbeat(heartbeat) => handle_heartbeat(heartbeat, worker_id, session, state).await,
        Message::TaskUpdate(update) => {
            handle_task_update(update, worker_id, state).await;
            None
        }
        Message::Ack(ack) => {
            debug!(worker_id = %worker_id, ref_kind = %ack.ref_kind, ok = ack.ok, "Ack from worker");
            None
        }
        other => {
            let kind = other.kind();
            warn!(worker_id = %worker_id, kind = %kind, "Unexpected message from worker");
            Some(Message::Ack(Ack::rejected(
                kind,
                worker_id.as_str(),
                "not accepted from workers",
            )))
        }
    }
}

async fn handle_heartbeat(
    heartbeat: Heartbeat,
    worker_id: &WorkerId,
    session: u64,
    state: &MasterState,
) -> Option<Message> {
    if &heartbeat.worker_id != worker_id {
        warn!(
            worker_id = %worker_id,
            claimed = %heartbeat.worker_id,
            "Heartbeat for another worker ignored"
        );
        return None;
    }

    let current = state
        .workers
        .heartbeat(
            worker_id,
            session,
            heartbeat.timestamp,
            heartbeat.capacity,
            heartbeat.usage,
        )
        .await;
    if !current {
        return None;
    }
    if let Some(usage) = heartbeat.usage {
        state.record_usage(worker_id, heartbeat.timestamp, usage);
    }
    debug!(worker_id = %worker_id, load = heartbeat.load, "Heartbeat");
    Some(Message::Ack(Ack::ok(MessageKind::Heartbeat, worker_id.as_str())))
}

async fn handle_task_update(update: TaskUpdateMsg, worker_id: &WorkerId, state: &MasterState) {
    let (task_id, update) = update.into_parts();
    let terminal = update.status.is_terminal();

    match state.registry.apply_update(&task_id, worker_id, update).await {
        Ok(outcome) if terminal => {
            if outcome.reached_terminal() {
                state.finish_task(worker_id, &task_id).await;
            } else {
                state.release_task(worker_id, &task_id).await;
            }
        }
        Ok(_) => {}
        Err(e @ TaskError::StaleUpdate { .. }) => {
            Counters::incr(&state.counters.stale_updates);
            warn!(worker_id = %worker_id, task_id = %task_id, error = %e, "Stale task update");
        }
        Err(e) => {
            warn!(worker_id = %worker_id, task_id = %task_id, error = %e, "Task update rejected");
        }
    }
}
