//! Shared master state.
//!
//! Bundles the registry, worker set, scheduler and discovery list, and
//! exposes the submit/cancel/query operations used by presentation layers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};

use winlink_core::{ResourceUsage, TaskError, TaskId, TaskSpec, TaskStatus, WorkerId};
use winlink_proto::{Cancel, Message};

use crate::config::MasterConfig;
use crate::discovery::DiscoveredSet;
use crate::metrics::Counters;
use crate::persistence::{HistoryStore, PersistenceError, UsageRecord};
use crate::registry::{CancelOutcome, TaskRegistry};
use crate::scheduler::Scheduler;
use crate::workers::{Outbound, WorkerSet};

/// Shared master state.
pub struct MasterState {
    pub config: MasterConfig,
    pub registry: Arc<TaskRegistry>,
    pub workers: Arc<WorkerSet>,
    pub scheduler: Arc<Scheduler>,
    pub discovered: Arc<DiscoveredSet>,
    pub counters: Counters,
    pub started_at: DateTime<Utc>,
    history: Option<Arc<dyn HistoryStore>>,
    usage_feed: Option<mpsc::UnboundedSender<UsageRecord>>,
}

impl MasterState {
    /// Create the state around `registry` (which may already carry a
    /// persistence journal).
    pub fn new(config: MasterConfig, registry: TaskRegistry) -> Arc<Self> {
        Self::build(config, registry, None, None)
    }

    /// Like [`MasterState::new`], with usage samples sent to `usage_feed`
    /// and usage history read back from `history`.
    pub fn with_history(
        config: MasterConfig,
        registry: TaskRegistry,
        history: Arc<dyn HistoryStore>,
        usage_feed: mpsc::UnboundedSender<UsageRecord>,
    ) -> Arc<Self> {
        Self::build(config, registry, Some(history), Some(usage_feed))
    }

    fn build(
        config: MasterConfig,
        registry: TaskRegistry,
        history: Option<Arc<dyn HistoryStore>>,
        usage_feed: Option<mpsc::UnboundedSender<UsageRecord>>,
    ) -> Arc<Self> {
        let registry = Arc::new(registry);
        let workers = Arc::new(WorkerSet::new());
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            workers.clone(),
            config.strategy.build(),
            config.dispatch_send_timeout(),
        ));

        Arc::new(Self {
            config,
            registry,
            workers,
            scheduler,
            discovered: Arc::new(DiscoveredSet::new()),
            counters: Counters::default(),
            started_at: Utc::now(),
            history,
            usage_feed,
        })
    }

    /// Submit a task, filling omitted priority and resources from the
    /// configured defaults, and wake the scheduler.
    pub async fn submit_task(&self, mut spec: TaskSpec) -> Result<TaskId, TaskError> {
        spec.priority.get_or_insert(self.config.default_priority);
        spec.resources.get_or_insert(self.config.default_resources);
        let task_id = self.registry.submit(spec).await?;
        self.scheduler.trigger();
        Ok(task_id)
    }

    /// Cancel a task and, if it was on a worker, tell the worker to stop.
    ///
    /// The worker's slot is freed immediately.
    pub async fn cancel_task(&self, task_id: &TaskId, reason: &str) -> Result<CancelOutcome, TaskError> {
        let outcome = self.registry.cancel(task_id, reason).await?;

        if let (Some(worker_id), true) = (&outcome.worker, outcome.previous.is_active()) {
            self.workers.release(worker_id, task_id).await;

            let cancel = Message::Cancel(Cancel {
                task_id: task_id.clone(),
                reason: reason.to_string(),
            });
            match self.workers.sender(worker_id).await {
                Some(tx) if tx.send(Outbound::new(cancel)).await.is_ok() => {}
                _ => warn!(
                    task_id = %task_id,
                    worker_id = %worker_id,
                    "Worker unreachable, cancel not delivered"
                ),
            }
            self.scheduler.trigger();
        }
        Ok(outcome)
    }

    /// Free the slot of a task that finished on `worker_id`.
    pub async fn release_task(&self, worker_id: &WorkerId, task_id: &TaskId) {
        if self.workers.release(worker_id, task_id).await {
            self.scheduler.trigger();
        }
    }

    /// Free the slot of a finished task and fold its outcome into the
    /// worker's performance figures. Cancellations do not count.
    pub async fn finish_task(&self, worker_id: &WorkerId, task_id: &TaskId) {
        if let Some(task) = self.registry.get(task_id).await {
            let succeeded = match task.status {
                TaskStatus::Succeeded => Some(true),
                TaskStatus::Failed | TaskStatus::TimedOut => Some(false),
                _ => None,
            };
            if let Some(succeeded) = succeeded {
                self.workers
                    .record_outcome(worker_id, succeeded, task.execution_time())
                    .await;
            }
        }
        self.release_task(worker_id, task_id).await;
    }

    /// Queue a worker's usage sample for the history store.
    pub fn record_usage(&self, worker_id: &WorkerId, timestamp: DateTime<Utc>, usage: ResourceUsage) {
        if let Some(feed) = &self.usage_feed {
            let record = UsageRecord {
                worker_id: worker_id.clone(),
                timestamp,
                usage,
            };
            if feed.send(record).is_err() {
                warn!(worker_id = %worker_id, "History recorder gone, usage sample dropped");
            }
        }
    }

    /// Usage samples of `worker_id` taken at or after `since`.
    pub async fn usage_history(
        &self,
        worker_id: &WorkerId,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, PersistenceError> {
        match &self.history {
            Some(store) => store.load_usage(worker_id, since).await,
            None => Err(PersistenceError::Unavailable(
                "no history store configured".to_string(),
            )),
        }
    }

    /// Return tasks held by a lost worker to the queue.
    pub async fn requeue_from(&self, worker_id: &WorkerId, tasks: &[TaskId]) -> usize {
        let mut requeued = 0;
        for task_id in tasks {
            match self.registry.requeue(task_id, worker_id).await {
                Ok(true) => requeued += 1,
                Ok(false) => {}
                Err(e) => warn!(task_id = %task_id, error = %e, "Requeue skipped"),
            }
        }
        if requeued > 0 {
            Counters::add(&self.counters.requeued_tasks, requeued as u64);
            info!(worker_id = %worker_id, requeued, "Requeued tasks from lost worker");
            self.scheduler.trigger();
        }
        requeued
    }
}
