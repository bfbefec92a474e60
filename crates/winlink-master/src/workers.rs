//! Live worker set.
//!
//! Mutated by connection sessions (register, heartbeat, disconnect), by the
//! scheduler (assign/release) and by the monitor (expiry, reaping). Readers
//! get point-in-time [`WorkerSnapshot`]s that may be momentarily stale.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};

use winlink_core::{
    ConnectionState, ResourceLimits, ResourceUsage, TaskId, WorkerCapacity, WorkerId, WorkerInfo,
};
use winlink_proto::{Message, TransportError};

/// A message queued for a worker's session writer.
///
/// When `done` is set the session reports whether the frame reached the
/// wire.
#[derive(Debug)]
pub struct Outbound {
    pub message: Message,
    pub done: Option<oneshot::Sender<Result<(), TransportError>>>,
}

impl Outbound {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            done: None,
        }
    }

    /// Create an outbound message plus a receiver for its send result.
    pub fn with_ack(message: Message) -> (Self, oneshot::Receiver<Result<(), TransportError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                message,
                done: Some(tx),
            },
            rx,
        )
    }
}

/// Weight of the newest outcome in [`WorkerPerformance::success_rate`].
const SUCCESS_RATE_ALPHA: f64 = 0.1;

/// Outcome history of the tasks a worker finished.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WorkerPerformance {
    pub succeeded: u64,
    pub failed: u64,
    /// Exponentially weighted; starts at 1.0.
    pub success_rate: f64,
    /// Mean run time of finished tasks that reported one.
    pub avg_duration_secs: f64,
    #[serde(skip)]
    timed: u64,
}

impl Default for WorkerPerformance {
    fn default() -> Self {
        Self {
            succeeded: 0,
            failed: 0,
            success_rate: 1.0,
            avg_duration_secs: 0.0,
            timed: 0,
        }
    }
}

impl WorkerPerformance {
    pub fn record(&mut self, succeeded: bool, duration: Option<Duration>) {
        let outcome = if succeeded {
            self.succeeded += 1;
            1.0
        } else {
            self.failed += 1;
            0.0
        };
        self.success_rate =
            SUCCESS_RATE_ALPHA * outcome + (1.0 - SUCCESS_RATE_ALPHA) * self.success_rate;

        if let Some(duration) = duration {
            self.timed += 1;
            self.avg_duration_secs +=
                (duration.as_secs_f64() - self.avg_duration_secs) / self.timed as f64;
        }
    }

    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed
    }
}

struct WorkerEntry {
    info: WorkerInfo,
    state: ConnectionState,
    assigned: HashMap<TaskId, ResourceLimits>,
    usage: Option<ResourceUsage>,
    performance: WorkerPerformance,
    last_heartbeat: DateTime<Utc>,
    last_seen: Instant,
    disconnected_at: Option<Instant>,
    session: u64,
    tx: Option<mpsc::Sender<Outbound>>,
}

impl WorkerEntry {
    fn snapshot(&self) -> WorkerSnapshot {
        let used_cpu: u32 = self.assigned.values().map(|l| l.max_cpu).sum();
        let used_memory: u64 = self.assigned.values().map(|l| l.max_memory_mb).sum();
        let mut assigned: Vec<TaskId> = self.assigned.keys().cloned().collect();
        assigned.sort();

        WorkerSnapshot {
            info: self.info.clone(),
            state: self.state,
            load: self.assigned.len() as u32,
            free_cpu: self.info.capacity.cpu_percent.saturating_sub(used_cpu),
            free_memory_mb: self.info.capacity.memory_mb.saturating_sub(used_memory),
            usage: self.usage,
            performance: self.performance,
            last_heartbeat: self.last_heartbeat,
            assigned,
        }
    }

    fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.disconnected_at = Some(Instant::now());
        // Dropping the sender ends the session's outbound loop.
        self.tx = None;
    }
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    pub info: WorkerInfo,
    pub state: ConnectionState,
    /// Number of tasks currently attributed to the worker.
    pub load: u32,
    pub free_cpu: u32,
    pub free_memory_mb: u64,
    /// Latest host usage reported on a heartbeat.
    pub usage: Option<ResourceUsage>,
    pub performance: WorkerPerformance,
    pub last_heartbeat: DateTime<Utc>,
    pub assigned: Vec<TaskId>,
}

impl WorkerSnapshot {
    pub fn worker_id(&self) -> &WorkerId {
        &self.info.worker_id
    }

    pub fn capacity(&self) -> &WorkerCapacity {
        &self.info.capacity
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn has_free_slot(&self) -> bool {
        self.load < self.info.capacity.max_tasks
    }

    /// Load relative to slot count; a worker without slots counts as full.
    pub fn load_ratio(&self) -> f64 {
        match self.info.capacity.max_tasks {
            0 => 1.0,
            slots => self.load as f64 / slots as f64,
        }
    }

    /// Whether the worker's free CPU and memory cover `limits` right now.
    pub fn has_free_resources(&self, limits: &ResourceLimits) -> bool {
        self.free_cpu >= limits.max_cpu && self.free_memory_mb >= limits.max_memory_mb
    }
}

/// Outcome of a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Identifies this connection; stale sessions cannot disconnect a newer one.
    pub session: u64,
    /// Tasks the master attributed to the worker that it no longer reports.
    pub orphaned: Vec<TaskId>,
    /// Whether the worker was already known (reconnect within grace).
    pub reconnected: bool,
}

/// The set of known workers.
pub struct WorkerSet {
    workers: RwLock<HashMap<WorkerId, WorkerEntry>>,
    next_session: AtomicU64,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    /// Register a worker (new or reconnecting) with its outbound channel.
    ///
    /// A reconnecting worker keeps the tasks it still reports in
    /// `active_tasks`; the rest are released and returned as orphaned.
    pub async fn register(
        &self,
        info: WorkerInfo,
        tx: mpsc::Sender<Outbound>,
        active_tasks: &[TaskId],
    ) -> Registration {
        let session = self.next_session.fetch_add(1, Ordering::SeqCst);
        let mut workers = self.workers.write().await;
        let worker_id = info.worker_id.clone();

        match workers.get_mut(&worker_id) {
            Some(entry) => {
                let orphaned: Vec<TaskId> = entry
                    .assigned
                    .keys()
                    .filter(|id| !active_tasks.contains(id))
                    .cloned()
                    .collect();
                for task_id in &orphaned {
                    entry.assigned.remove(task_id);
                }

                entry.info = info;
                entry.state = ConnectionState::Connected;
                entry.last_heartbeat = Utc::now();
                entry.last_seen = Instant::now();
                entry.disconnected_at = None;
                entry.session = session;
                entry.tx = Some(tx);

                info!(
                    worker_id = %worker_id,
                    kept = entry.assigned.len(),
                    orphaned = orphaned.len(),
                    "Worker reconnected"
                );
                Registration {
                    session,
                    orphaned,
                    reconnected: true,
                }
            }
            None => {
                info!(
                    worker_id = %worker_id,
                    hostname = %info.hostname,
                    cpu_percent = info.capacity.cpu_percent,
                    memory_mb = info.capacity.memory_mb,
                    max_tasks = info.capacity.max_tasks,
                    "Worker registered"
                );
                workers.insert(
                    worker_id,
                    WorkerEntry {
                        info,
                        state: ConnectionState::Connected,
                        assigned: HashMap::new(),
                        usage: None,
                        performance: WorkerPerformance::default(),
                        last_heartbeat: Utc::now(),
                        last_seen: Instant::now(),
                        disconnected_at: None,
                        session,
                        tx: Some(tx),
                    },
                );
                Registration {
                    session,
                    orphaned: Vec::new(),
                    reconnected: false,
                }
            }
        }
    }

    /// Record a heartbeat. Returns false if `session` is no longer current.
    pub async fn heartbeat(
        &self,
        worker_id: &WorkerId,
        session: u64,
        timestamp: DateTime<Utc>,
        capacity: WorkerCapacity,
        usage: Option<ResourceUsage>,
    ) -> bool {
        let mut workers = self.workers.write().await;
        match workers.get_mut(worker_id) {
            Some(entry) if entry.session == session && entry.state == ConnectionState::Connected => {
                entry.last_heartbeat = timestamp;
                entry.last_seen = Instant::now();
                entry.info.capacity = capacity;
                if usage.is_some() {
                    entry.usage = usage;
                }
                true
            }
            _ => false,
        }
    }

    /// Mark a worker DISCONNECTED when its session ends.
    ///
    /// Ignored if a newer session has already replaced `session`.
    pub async fn mark_disconnected(&self, worker_id: &WorkerId, session: u64) -> bool {
        let mut workers = self.workers.write().await;
        match workers.get_mut(worker_id) {
            Some(entry) if entry.session == session && entry.state == ConnectionState::Connected => {
                entry.disconnect();
                info!(
                    worker_id = %worker_id,
                    tasks = entry.assigned.len(),
                    "Worker disconnected"
                );
                true
            }
            _ => false,
        }
    }

    /// Disconnect workers silent for longer than `timeout`.
    pub async fn expire_stale(&self, timeout: Duration) -> Vec<WorkerId> {
        let mut workers = self.workers.write().await;
        let mut expired = Vec::new();
        for (worker_id, entry) in workers.iter_mut() {
            if entry.state == ConnectionState::Connected && entry.last_seen.elapsed() >= timeout {
                entry.disconnect();
                warn!(
                    worker_id = %worker_id,
                    silent_secs = entry.last_seen.elapsed().as_secs(),
                    "Worker missed heartbeats, marking disconnected"
                );
                expired.push(worker_id.clone());
            }
        }
        expired
    }

    /// Remove workers DISCONNECTED for at least `grace`, returning the tasks
    /// they still held.
    pub async fn reap(&self, grace: Duration) -> Vec<(WorkerId, Vec<TaskId>)> {
        let mut workers = self.workers.write().await;
        let expired: Vec<WorkerId> = workers
            .iter()
            .filter(|(_, entry)| {
                entry.state == ConnectionState::Disconnected
                    && entry
                        .disconnected_at
                        .is_some_and(|at| at.elapsed() >= grace)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut reaped = Vec::with_capacity(expired.len());
        for worker_id in expired {
            if let Some(entry) = workers.remove(&worker_id) {
                let mut tasks: Vec<TaskId> = entry.assigned.into_keys().collect();
                tasks.sort();
                info!(
                    worker_id = %worker_id,
                    tasks = tasks.len(),
                    "Worker grace period elapsed, removing"
                );
                reaped.push((worker_id, tasks));
            }
        }
        reaped
    }

    /// Reserve a slot on a connected worker for `task_id`.
    pub async fn assign(&self, worker_id: &WorkerId, task_id: &TaskId, limits: ResourceLimits) -> bool {
        let mut workers = self.workers.write().await;
        match workers.get_mut(worker_id) {
            Some(entry)
                if entry.state == ConnectionState::Connected
                    && (entry.assigned.len() as u32) < entry.info.capacity.max_tasks =>
            {
                entry.assigned.insert(task_id.clone(), limits);
                true
            }
            _ => false,
        }
    }

    /// Free the slot held by `task_id`. Returns false if it held none.
    pub async fn release(&self, worker_id: &WorkerId, task_id: &TaskId) -> bool {
        let mut workers = self.workers.write().await;
        workers
            .get_mut(worker_id)
            .is_some_and(|entry| entry.assigned.remove(task_id).is_some())
    }

    /// Fold a finished task into the worker's performance figures.
    pub async fn record_outcome(
        &self,
        worker_id: &WorkerId,
        succeeded: bool,
        duration: Option<Duration>,
    ) {
        if let Some(entry) = self.workers.write().await.get_mut(worker_id) {
            entry.performance.record(succeeded, duration);
        }
    }

    /// Outbound channel of a connected worker.
    pub async fn sender(&self, worker_id: &WorkerId) -> Option<mpsc::Sender<Outbound>> {
        self.workers
            .read()
            .await
            .get(worker_id)
            .and_then(|entry| entry.tx.clone())
    }

    pub async fn get(&self, worker_id: &WorkerId) -> Option<WorkerSnapshot> {
        self.workers.read().await.get(worker_id).map(WorkerEntry::snapshot)
    }

    /// All workers ordered by id.
    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut snapshots: Vec<_> = self
            .workers
            .read()
            .await
            .values()
            .map(WorkerEntry::snapshot)
            .collect();
        snapshots.sort_by(|a, b| a.worker_id().cmp(b.worker_id()));
        snapshots
    }

    pub async fn connected_count(&self) -> usize {
        self.workers
            .read()
            .await
            .values()
            .filter(|e| e.state == ConnectionState::Connected)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }
}

impl Default for WorkerSet {
    fn default() -> Self {
        Self::new()
    }
}
