//! Discovery beacon listener.
//!
//! Collects worker beacons into a list of discovered nodes, separate from the
//! connected worker set. Nothing here touches task or worker state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use winlink_core::{WorkerCapacity, WorkerId};
use winlink_proto::discovery::MAX_BEACON_LEN;
use winlink_proto::Beacon;

/// A node seen through its beacon.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredNode {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub version: String,
    pub capacity: WorkerCapacity,
    pub source: SocketAddr,
    pub last_seen: DateTime<Utc>,
    #[serde(skip)]
    seen_at: Instant,
}

#[derive(Default)]
pub struct DiscoveredSet {
    nodes: RwLock<HashMap<WorkerId, DiscoveredNode>>,
}

impl DiscoveredSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn observe(&self, beacon: Beacon, source: SocketAddr) {
        let mut nodes = self.nodes.write().await;
        if !nodes.contains_key(&beacon.worker_id) {
            info!(worker_id = %beacon.worker_id, source = %source, "Discovered worker");
        }
        nodes.insert(
            beacon.worker_id.clone(),
            DiscoveredNode {
                worker_id: beacon.worker_id,
                hostname: beacon.hostname,
                version: beacon.version,
                capacity: beacon.capacity,
                source,
                last_seen: Utc::now(),
                seen_at: Instant::now(),
            },
        );
    }

    /// Forget nodes not heard from within `stale`.
    pub async fn prune(&self, stale: Duration) -> usize {
        let mut nodes = self.nodes.write().await;
        let before = nodes.len();
        nodes.retain(|_, node| node.seen_at.elapsed() < stale);
        before - nodes.len()
    }

    pub async fn list(&self) -> Vec<DiscoveredNode> {
        let mut nodes: Vec<_> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        nodes
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}

/// Receive beacons on `socket` until `shutdown`, pruning stale entries.
pub async fn listen(
    socket: UdpSocket,
    discovered: Arc<DiscoveredSet>,
    stale: Duration,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_BEACON_LEN + 1];
    let mut prune = tokio::time::interval(stale.max(Duration::from_secs(1)));

    if let Ok(addr) = socket.local_addr() {
        info!(addr = %addr, "Discovery listener started");
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = prune.tick() => {
                let removed = discovered.prune(stale).await;
                if removed > 0 {
                    debug!(removed, "Pruned stale discovered workers");
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, source)) => match Beacon::from_bytes(&buf[..len]) {
                    Ok(beacon) => discovered.observe(beacon, source).await,
                    Err(e) => debug!(source = %source, error = %e, "Ignoring malformed beacon"),
                },
                Err(e) => debug!(error = %e, "Discovery receive error"),
            },
        }
    }
}
