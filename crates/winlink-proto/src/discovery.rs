//! Presence beacons broadcast by workers over UDP.
//!
//! Beacons are unauthenticated and only ever populate the master's list of
//! discovered nodes; they never register a worker or touch task state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use winlink_core::{WorkerCapacity, WorkerId};

use crate::error::TransportError;

/// Well-known UDP port for discovery beacons.
pub const DEFAULT_DISCOVERY_PORT: u16 = 5000;

/// Largest beacon datagram accepted.
pub const MAX_BEACON_LEN: usize = 4096;

/// A worker's presence announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub version: String,
    pub capacity: WorkerCapacity,
    pub timestamp: DateTime<Utc>,
}

impl Beacon {
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() > MAX_BEACON_LEN {
            return Err(TransportError::Codec(format!(
                "beacon of {} bytes exceeds {}",
                bytes.len(),
                MAX_BEACON_LEN
            )));
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_round_trip() {
        let beacon = Beacon {
            worker_id: WorkerId::new("w1"),
            hostname: "lab-pc".into(),
            version: "0.1.0".into(),
            capacity: WorkerCapacity::new(50, 512, 5),
            timestamp: Utc::now(),
        };
        let back = Beacon::from_bytes(&beacon.to_bytes().unwrap()).unwrap();
        assert_eq!(back, beacon);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Beacon::from_bytes(b"hello").is_err());
        assert!(Beacon::from_bytes(&vec![b' '; MAX_BEACON_LEN + 1]).is_err());
    }
}
