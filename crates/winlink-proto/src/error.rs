//! Transport, TLS and authentication errors.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the framed transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// All connection attempts failed.
    #[error("Connect to {address} failed after {attempts} attempt(s): {reason}")]
    ConnectFailed {
        address: String,
        attempts: u32,
        reason: String,
    },

    /// The peer closed the connection.
    #[error("Peer disconnected: {0}")]
    Disconnected(String),

    /// An operation did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// TLS setup or handshake failure.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// The registration exchange was rejected or malformed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Too many envelopes from this peer failed authentication.
    #[error("Closing connection after {0} consecutive authentication failures")]
    AuthViolations(u32),

    /// No port in the configured range could be bound.
    #[error("Failed to bind {host} on ports {start}..={end}: {reason}")]
    Bind {
        host: String,
        start: u16,
        end: u16,
        reason: String,
    },
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Codec(e.to_string())
    }
}

/// Error type for TLS configuration issues.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Certificate file not found: {0}")]
    CertNotFound(PathBuf),

    #[error("Private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("No certificate found in PEM input")]
    NoCertificates,

    #[error("No supported private key found in PEM input")]
    NoPrivateKey,

    #[error("Failed to parse PEM: {0}")]
    Pem(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("TLS configuration rejected: {0}")]
    Config(String),

    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the message authenticator.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Shared secret is empty")]
    EmptySecret,

    #[error("Failed to read shared secret from {path}: {source}")]
    SecretUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Token is not valid hex")]
    MalformedToken,

    #[error("Token does not match envelope")]
    Mismatch,
}
