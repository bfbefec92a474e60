//! Per-envelope message authentication.
//!
//! Every envelope carries `hex(HMAC-SHA256(secret, seq_be || body))`. The
//! secret is distributed out of band; verification is constant-time.

use std::path::Path;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies envelopes with a shared secret.
#[derive(Clone)]
pub struct MessageAuthenticator {
    secret: Vec<u8>,
}

impl MessageAuthenticator {
    /// Create an authenticator from raw secret bytes.
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, AuthError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(AuthError::EmptySecret);
        }
        Ok(Self { secret })
    }

    /// Load the shared secret from a file, ignoring surrounding whitespace.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| AuthError::SecretUnreadable {
                path: path.to_path_buf(),
                source,
            })?;
        Self::new(raw.trim().as_bytes().to_vec())
    }

    /// Generate a random hex secret suitable for writing to a secret file.
    pub fn generate_secret() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    fn mac(&self, seq: u64, body: &[u8]) -> HmacSha256 {
        let mut mac = match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC accepts keys of any length"),
        };
        mac.update(&seq.to_be_bytes());
        mac.update(body);
        mac
    }

    /// Compute the hex token for an envelope.
    pub fn sign(&self, seq: u64, body: &[u8]) -> String {
        hex::encode(self.mac(seq, body).finalize().into_bytes())
    }

    /// Verify a hex token in constant time.
    pub fn verify(&self, seq: u64, body: &[u8], token: &str) -> Result<(), AuthError> {
        let expected = hex::decode(token).map_err(|_| AuthError::MalformedToken)?;
        self.mac(seq, body)
            .verify_slice(&expected)
            .map_err(|_| AuthError::Mismatch)
    }
}

impl std::fmt::Debug for MessageAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageAuthenticator")
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let auth = MessageAuthenticator::new("s3cret").unwrap();
        let token = auth.sign(1, b"{\"type\":\"heartbeat\"}");
        assert_eq!(token.len(), 64);
        assert!(auth.verify(1, b"{\"type\":\"heartbeat\"}", &token).is_ok());
    }

    #[test]
    fn test_tampered_body_or_seq_rejected() {
        let auth = MessageAuthenticator::new("s3cret").unwrap();
        let token = auth.sign(5, b"body");
        assert!(matches!(
            auth.verify(5, b"bodY", &token),
            Err(AuthError::Mismatch)
        ));
        assert!(matches!(
            auth.verify(6, b"body", &token),
            Err(AuthError::Mismatch)
        ));
    }

    #[test]
    fn test_other_secret_rejected() {
        let a = MessageAuthenticator::new("one").unwrap();
        let b = MessageAuthenticator::new("two").unwrap();
        let token = a.sign(1, b"x");
        assert!(b.verify(1, b"x", &token).is_err());
    }

    #[test]
    fn test_malformed_token() {
        let auth = MessageAuthenticator::new("s3cret").unwrap();
        assert!(matches!(
            auth.verify(1, b"x", "not-hex"),
            Err(AuthError::MalformedToken)
        ));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(
            MessageAuthenticator::new(Vec::new()),
            Err(AuthError::EmptySecret)
        ));
    }

    #[test]
    fn test_generated_secret_is_hex() {
        let secret = MessageAuthenticator::generate_secret();
        assert_eq!(secret.len(), 64);
        assert!(hex::decode(&secret).is_ok());
    }
}
