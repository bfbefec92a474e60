//! Wire protocol and security layer for WinLink.
//!
//! This crate contains:
//! - Message schemas exchanged between master and workers
//! - Signed envelopes and the HMAC authenticator
//! - TLS identity loading and rustls configuration
//! - Length-prefixed framed connections with sequence tracking
//! - Connect-with-retry, port-range binding and the shared retry policy
//! - Discovery beacons

pub mod auth;
pub mod connection;
pub mod convert;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod message;
pub mod retry;
pub mod socket;
pub mod tls;
pub mod transport;

// Re-export commonly used types
pub use auth::MessageAuthenticator;
pub use connection::{Connection, ConnectionReader, ConnectionWriter};
pub use discovery::Beacon;
pub use envelope::Envelope;
pub use error::{AuthError, TlsError, TransportError};
pub use message::{
    Ack, Cancel, Heartbeat, Message, MessageKind, Register, SubmitMetadata, TaskSubmit,
    TaskUpdateMsg,
};
pub use retry::RetryPolicy;
pub use tls::{TlsIdentity, TlsPaths};
pub use transport::{connect, ClientConnection, ConnectOptions, ServerConnection};
