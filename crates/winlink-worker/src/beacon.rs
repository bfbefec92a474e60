//! UDP presence beacon.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use winlink_core::WorkerInfo;
use winlink_proto::Beacon;

/// Broadcast a beacon for `info` to `target` every `interval` until shutdown.
pub async fn broadcast(
    socket: UdpSocket,
    target: SocketAddr,
    info: WorkerInfo,
    interval: Duration,
    shutdown: CancellationToken,
) {
    if let Err(e) = socket.set_broadcast(true) {
        warn!(error = %e, "Could not enable broadcast on beacon socket");
    }
    info!(target = %target, interval_secs = interval.as_secs(), "Broadcasting presence beacon");

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let beacon = Beacon {
            worker_id: info.worker_id.clone(),
            hostname: info.hostname.clone(),
            version: info.version.clone(),
            capacity: info.capacity,
            timestamp: Utc::now(),
        };
        let bytes = match beacon.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode beacon");
                continue;
            }
        };
        match socket.send_to(&bytes, target).await {
            Ok(_) => debug!(target = %target, "Beacon sent"),
            Err(e) => warn!(target = %target, error = %e, "Beacon send failed"),
        }
    }

    debug!("Beacon stopped");
}
