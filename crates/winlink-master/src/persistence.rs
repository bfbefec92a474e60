//! Task history persistence.
//!
//! The registry journals every transition on an unbounded channel; the
//! [`Recorder`] drains it on its own task and appends the interesting ones to
//! a [`HistoryStore`]. Write failures are retried with the shared
//! [`RetryPolicy`] and then logged, so a slow or broken store never holds up
//! task progress.
//!
//! Worker usage samples travel the same way on a second channel and land in
//! the store's usage history. With a retention window set, the recorder
//! periodically prunes finished tasks and usage samples older than it.
//!
//! On restart [`reload`] takes the last record of every task and returns the
//! non-terminal ones, reset to QUEUED, for the registry to restore.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use winlink_core::{ResourceUsage, Task, TaskEvent, TaskEventKind, TaskId, WorkerId};
use winlink_proto::RetryPolicy;

use crate::registry::TaskRegistry;

/// Persistence errors.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("History I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("History serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("History store unavailable: {0}")]
    Unavailable(String),
}

/// One row of task history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    pub kind: TaskEventKind,
    pub task: Task,
}

impl From<&TaskEvent> for HistoryRecord {
    fn from(event: &TaskEvent) -> Self {
        Self {
            task_id: event.task_id.clone(),
            timestamp: event.timestamp,
            kind: event.kind,
            task: event.task.clone(),
        }
    }
}

/// One host usage sample reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub worker_id: WorkerId,
    pub timestamp: DateTime<Utc>,
    pub usage: ResourceUsage,
}

/// What a retention sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Finished tasks whose records were dropped.
    pub tasks: usize,
    pub usage: usize,
}

/// Task ids whose last record is terminal and older than `cutoff`.
fn expired_tasks(records: &[HistoryRecord], cutoff: DateTime<Utc>) -> HashSet<TaskId> {
    let mut latest: HashMap<&TaskId, &HistoryRecord> = HashMap::new();
    for record in records {
        latest.insert(&record.task_id, record);
    }
    latest
        .into_iter()
        .filter(|(_, r)| r.task.is_terminal() && r.timestamp < cutoff)
        .map(|(id, _)| id.clone())
        .collect()
}

/// Durable record storage.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, record: &HistoryRecord) -> Result<(), PersistenceError>;

    /// All records in append order.
    async fn load(&self) -> Result<Vec<HistoryRecord>, PersistenceError>;

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), PersistenceError>;

    /// Usage samples of one worker taken at or after `since`, oldest first.
    async fn load_usage(
        &self,
        worker_id: &WorkerId,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, PersistenceError>;

    /// Drop finished tasks and usage samples older than `cutoff`.
    ///
    /// Unfinished tasks are kept whatever their age.
    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<PruneReport, PersistenceError>;
}

/// Append-only JSON-lines files: task records at `path`, usage samples
/// next to it with a `.usage.jsonl` extension.
pub struct JsonlHistoryStore {
    path: PathBuf,
    usage_path: PathBuf,
    file: Mutex<Option<File>>,
    usage_file: Mutex<Option<File>>,
}

impl JsonlHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            usage_path: path.with_extension("usage.jsonl"),
            path,
            file: Mutex::new(None),
            usage_file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn usage_path(&self) -> &Path {
        &self.usage_path
    }
}

async fn open_append(path: &Path) -> Result<File, PersistenceError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(file)
}

/// Append one JSON line, opening the file on first use.
async fn append_line<T: Serialize>(
    slot: &Mutex<Option<File>>,
    path: &Path,
    record: &T,
) -> Result<(), PersistenceError> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');

    let mut guard = slot.lock().await;
    if guard.is_none() {
        *guard = Some(open_append(path).await?);
    }
    let Some(file) = guard.as_mut() else {
        return Err(PersistenceError::Unavailable(path.display().to_string()));
    };

    let written = async {
        file.write_all(&line).await?;
        file.flush().await?;
        file.sync_data().await
    }
    .await;

    if let Err(e) = written {
        // Reopen on the next attempt.
        *guard = None;
        return Err(e.into());
    }
    Ok(())
}

async fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, PersistenceError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                path = %path.display(),
                line = index + 1,
                error = %e,
                "Skipping corrupt history line"
            ),
        }
    }
    Ok(records)
}

/// Replace `path` with `records` through a temporary file and a rename.
async fn rewrite<T: Serialize>(path: &Path, records: &[T]) -> Result<(), PersistenceError> {
    let mut body = Vec::new();
    for record in records {
        serde_json::to_writer(&mut body, record)?;
        body.push(b'\n');
    }
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp).await?;
    file.write_all(&body).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl HistoryStore for JsonlHistoryStore {
    async fn append(&self, record: &HistoryRecord) -> Result<(), PersistenceError> {
        append_line(&self.file, &self.path, record).await
    }

    async fn load(&self) -> Result<Vec<HistoryRecord>, PersistenceError> {
        read_lines(&self.path).await
    }

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), PersistenceError> {
        append_line(&self.usage_file, &self.usage_path, record).await
    }

    async fn load_usage(
        &self,
        worker_id: &WorkerId,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, PersistenceError> {
        let records: Vec<UsageRecord> = read_lines(&self.usage_path).await?;
        Ok(records
            .into_iter()
            .filter(|r| &r.worker_id == worker_id && r.timestamp >= since)
            .collect())
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<PruneReport, PersistenceError> {
        let mut report = PruneReport::default();

        // Holding the append slot keeps writers out while the file is replaced.
        {
            let mut guard = self.file.lock().await;
            let records: Vec<HistoryRecord> = read_lines(&self.path).await?;
            let expired = expired_tasks(&records, cutoff);
            if !expired.is_empty() {
                let kept: Vec<&HistoryRecord> = records
                    .iter()
                    .filter(|r| !expired.contains(&r.task_id))
                    .collect();
                rewrite(&self.path, &kept).await?;
                *guard = None;
                report.tasks = expired.len();
            }
        }

        let mut guard = self.usage_file.lock().await;
        let samples: Vec<UsageRecord> = read_lines(&self.usage_path).await?;
        let kept: Vec<&UsageRecord> = samples.iter().filter(|r| r.timestamp >= cutoff).collect();
        if kept.len() < samples.len() {
            rewrite(&self.usage_path, &kept).await?;
            *guard = None;
            report.usage = samples.len() - kept.len();
        }
        Ok(report)
    }
}

/// In-memory store, used when no history path is configured.
#[derive(Default)]
pub struct MemoryHistoryStore {
    records: Mutex<Vec<HistoryRecord>>,
    usage: Mutex<Vec<UsageRecord>>,
    failures: AtomicU32,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` appends fail.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<HistoryRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, record: &HistoryRecord) -> Result<(), PersistenceError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PersistenceError::Unavailable("injected failure".to_string()));
        }
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<HistoryRecord>, PersistenceError> {
        Ok(self.records().await)
    }

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), PersistenceError> {
        self.usage.lock().await.push(record.clone());
        Ok(())
    }

    async fn load_usage(
        &self,
        worker_id: &WorkerId,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, PersistenceError> {
        Ok(self
            .usage
            .lock()
            .await
            .iter()
            .filter(|r| &r.worker_id == worker_id && r.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<PruneReport, PersistenceError> {
        let mut records = self.records.lock().await;
        let expired = expired_tasks(&records, cutoff);
        records.retain(|r| !expired.contains(&r.task_id));

        let mut usage = self.usage.lock().await;
        let before = usage.len();
        usage.retain(|r| r.timestamp >= cutoff);

        Ok(PruneReport {
            tasks: expired.len(),
            usage: before - usage.len(),
        })
    }
}

/// Pause between retention sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Drains the registry journal into a [`HistoryStore`].
pub struct Recorder {
    store: Arc<dyn HistoryStore>,
    registry: Arc<TaskRegistry>,
    retry: RetryPolicy,
    record_intermediate: bool,
    retain_terminal: bool,
    usage_feed: Option<mpsc::UnboundedReceiver<UsageRecord>>,
    retention: Option<Duration>,
    sweep_interval: Duration,
}

impl Recorder {
    pub fn new(store: Arc<dyn HistoryStore>, registry: Arc<TaskRegistry>, retry: RetryPolicy) -> Self {
        Self {
            store,
            registry,
            retry,
            record_intermediate: false,
            retain_terminal: true,
            usage_feed: None,
            retention: None,
            sweep_interval: SWEEP_INTERVAL,
        }
    }

    /// Builder method to also record worker usage samples.
    pub fn with_usage(mut self, feed: mpsc::UnboundedReceiver<UsageRecord>) -> Self {
        self.usage_feed = Some(feed);
        self
    }

    /// Builder method to prune history older than `retention`; `None` keeps
    /// everything.
    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Builder method to also record dispatch, start, requeue and restore.
    pub fn with_intermediate(mut self, record_intermediate: bool) -> Self {
        self.record_intermediate = record_intermediate;
        self
    }

    /// Builder method to keep or archive terminal tasks once recorded.
    pub fn with_retain_terminal(mut self, retain_terminal: bool) -> Self {
        self.retain_terminal = retain_terminal;
        self
    }

    pub fn should_record(&self, kind: TaskEventKind) -> bool {
        match kind {
            TaskEventKind::Submitted | TaskEventKind::Finished => true,
            TaskEventKind::Dispatched
            | TaskEventKind::Started
            | TaskEventKind::Requeued
            | TaskEventKind::Restored => self.record_intermediate,
            TaskEventKind::Progress | TaskEventKind::Unschedulable => false,
        }
    }

    /// Append one event, retrying per the policy.
    pub async fn record(&self, event: &TaskEvent) -> Result<(), PersistenceError> {
        let record = HistoryRecord::from(event);
        self.retry
            .run("history append", |_| self.store.append(&record))
            .await
    }

    async fn handle(&self, event: TaskEvent) {
        if !self.should_record(event.kind) {
            return;
        }

        match self.record(&event).await {
            Ok(()) => {
                debug!(task_id = %event.task_id, kind = event.kind.as_str(), "History recorded");
                if event.is_terminal() && !self.retain_terminal {
                    self.registry.archive(&event.task_id).await;
                }
            }
            Err(e) => error!(
                task_id = %event.task_id,
                kind = event.kind.as_str(),
                error = %e,
                "Failed to record task history, giving up"
            ),
        }
    }

    async fn handle_usage(&self, record: UsageRecord) {
        let result = self
            .retry
            .run("usage append", |_| self.store.append_usage(&record))
            .await;
        if let Err(e) = result {
            warn!(worker_id = %record.worker_id, error = %e, "Failed to record usage sample");
        }
    }

    /// Prune the store and archive finished tasks older than the retention
    /// window.
    pub async fn sweep(&self) -> Option<PruneReport> {
        let retention = chrono::Duration::from_std(self.retention?).ok()?;
        let cutoff = Utc::now() - retention;

        let report = match self.store.prune(cutoff).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "History retention sweep failed");
                return None;
            }
        };

        let mut archived = 0;
        for task in self.registry.list().await {
            if task.finished_at.is_some_and(|at| at < cutoff)
                && self.registry.archive(&task.id).await
            {
                archived += 1;
            }
        }

        if report != PruneReport::default() || archived > 0 {
            info!(
                tasks = report.tasks,
                usage = report.usage,
                archived,
                "Pruned history past retention"
            );
        }
        Some(report)
    }

    /// Record journal events and usage samples until `shutdown`, then drain
    /// what is left.
    pub async fn run(
        mut self,
        mut journal: mpsc::UnboundedReceiver<TaskEvent>,
        shutdown: CancellationToken,
    ) {
        let mut usage = self.usage_feed.take();
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = journal.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => return,
                },
                record = next_usage(&mut usage) => match record {
                    Some(record) => self.handle_usage(record).await,
                    None => usage = None,
                },
                _ = sweep.tick(), if self.retention.is_some() => {
                    self.sweep().await;
                }
            }
        }
        while let Ok(event) = journal.try_recv() {
            self.handle(event).await;
        }
        if let Some(feed) = usage.as_mut() {
            while let Ok(record) = feed.try_recv() {
                self.handle_usage(record).await;
            }
        }
        debug!("History recorder stopped");
    }
}

async fn next_usage(feed: &mut Option<mpsc::UnboundedReceiver<UsageRecord>>) -> Option<UsageRecord> {
    match feed {
        Some(feed) => feed.recv().await,
        None => std::future::pending().await,
    }
}

/// Tasks to restore after a restart: the last record of each task that is
/// not terminal, reset to QUEUED, in submission order.
pub async fn reload(store: &dyn HistoryStore) -> Result<Vec<Task>, PersistenceError> {
    let records = store.load().await?;
    let total = records.len();

    let mut latest: HashMap<TaskId, Task> = HashMap::new();
    for record in records {
        latest.insert(record.task_id, record.task);
    }

    let mut pending: Vec<Task> = latest
        .into_values()
        .filter(|task| !task.is_terminal())
        .map(|mut task| {
            if task.status.is_active() {
                task.reset_to_queued(Some("recovered after master restart".to_string()));
            }
            task
        })
        .collect();
    pending.sort_by_key(|t| t.submit_seq);

    info!(records = total, pending = pending.len(), "History reloaded");
    Ok(pending)
}
