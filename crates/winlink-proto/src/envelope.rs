//! Signed envelopes.
//!
//! The body is kept as the exact JSON text that was signed, so verification
//! never depends on re-serialising the message.

use serde::{Deserialize, Serialize};

use crate::auth::MessageAuthenticator;
use crate::error::{AuthError, TransportError};
use crate::message::Message;

/// Wire unit: sequence number, authentication token and signed body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub token: String,
    pub body: String,
}

impl Envelope {
    /// Serialise and sign a message.
    pub fn seal(
        seq: u64,
        message: &Message,
        auth: &MessageAuthenticator,
    ) -> Result<Self, TransportError> {
        let body = serde_json::to_string(message)?;
        let token = auth.sign(seq, body.as_bytes());
        Ok(Self { seq, token, body })
    }

    /// Verify the token, then decode the body.
    ///
    /// Nothing is parsed from the body before the token checks out.
    pub fn open(&self, auth: &MessageAuthenticator) -> Result<Message, EnvelopeRejection> {
        auth.verify(self.seq, self.body.as_bytes(), &self.token)
            .map_err(EnvelopeRejection::Auth)?;
        serde_json::from_str(&self.body).map_err(|e| EnvelopeRejection::Malformed(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeRejection> {
        serde_json::from_slice(bytes).map_err(|e| EnvelopeRejection::Malformed(e.to_string()))
    }
}

/// Why an inbound frame was dropped.
#[derive(Debug)]
pub enum EnvelopeRejection {
    Auth(AuthError),
    Malformed(String),
}

impl std::fmt::Display for EnvelopeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeRejection::Auth(e) => write!(f, "authentication failed: {}", e),
            EnvelopeRejection::Malformed(e) => write!(f, "malformed envelope: {}", e),
        }
    }
}
