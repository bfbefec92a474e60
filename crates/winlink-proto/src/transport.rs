//! Client connection setup.
//!
//! `connect` opens TCP with keep-alive and no-delay, performs the TLS
//! handshake, sends `register` and waits for the master's `ack`. The whole
//! sequence is retried with the configured [`RetryPolicy`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::info;

use crate::auth::MessageAuthenticator;
use crate::connection::Connection;
use crate::error::TransportError;
use crate::message::{Message, MessageKind, Register};
use crate::retry::RetryPolicy;
use crate::socket::connect_tcp;
use crate::tls::server_name;

/// Worker-side connection to the master.
pub type ClientConnection = Connection<tokio_rustls::client::TlsStream<TcpStream>>;

/// Master-side connection to a worker.
pub type ServerConnection = Connection<tokio_rustls::server::TlsStream<TcpStream>>;

/// Where and how to connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// `host:port` of the master.
    pub address: String,
    /// Name the master's certificate must be valid for.
    pub server_name: String,
    /// Retry policy for the whole connect sequence.
    pub retry: RetryPolicy,
    /// Budget for TLS handshake plus registration.
    pub handshake_timeout_ms: u64,
    /// Consecutive authentication failures tolerated before closing.
    pub max_auth_failures: u32,
}

impl ConnectOptions {
    pub fn new(address: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            server_name: server_name.into(),
            retry: RetryPolicy::default(),
            handshake_timeout_ms: 10_000,
            max_auth_failures: crate::connection::DEFAULT_MAX_AUTH_FAILURES,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Connect to the master and complete registration.
///
/// Fails with `ConnectFailed` once every attempt allowed by the retry
/// policy has failed.
pub async fn connect(
    options: &ConnectOptions,
    connector: &TlsConnector,
    auth: Arc<MessageAuthenticator>,
    register: &Register,
) -> Result<ClientConnection, TransportError> {
    let attempts = options.retry.max_attempts.max(1);

    options
        .retry
        .run("connect", |_| connect_once(options, connector, auth.clone(), register))
        .await
        .map_err(|e| TransportError::ConnectFailed {
            address: options.address.clone(),
            attempts,
            reason: e.to_string(),
        })
}

async fn connect_once(
    options: &ConnectOptions,
    connector: &TlsConnector,
    auth: Arc<MessageAuthenticator>,
    register: &Register,
) -> Result<ClientConnection, TransportError> {
    let handshake = async {
        let tcp = connect_tcp(&options.address).await?;
        let name = server_name(&options.server_name)?;
        let tls = connector.connect(name, tcp).await?;

        let mut conn = Connection::new(tls, auth, options.address.clone())
            .with_max_auth_failures(options.max_auth_failures);

        conn.send(&Message::Register(register.clone())).await?;

        match conn.receive().await? {
            Some(Message::Ack(ack)) if ack.ref_kind == MessageKind::Register && ack.ok => Ok(conn),
            Some(Message::Ack(ack)) => Err(TransportError::Handshake(
                ack.detail.unwrap_or_else(|| "registration rejected".to_string()),
            )),
            Some(other) => Err(TransportError::Handshake(format!(
                "expected ack, got {}",
                other.kind()
            ))),
            None => Err(TransportError::Disconnected(
                "master closed during registration".to_string(),
            )),
        }
    };

    let conn = tokio::time::timeout(options.handshake_timeout(), handshake)
        .await
        .map_err(|_| TransportError::Timeout("handshake".to_string()))??;

    info!(
        master = %options.address,
        worker_id = %register.worker_id,
        "Registered with master"
    );
    Ok(conn)
}
