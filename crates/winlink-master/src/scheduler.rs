//! Task scheduler - binds queued tasks to workers.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use winlink_core::{Task, TaskError, TaskId, WorkerId};
use winlink_proto::{Message, TaskSubmit};

use crate::registry::TaskRegistry;
use crate::strategy::DispatchStrategy;
use crate::workers::{Outbound, WorkerSet, WorkerSnapshot};

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Worker {0} has no free slot")]
    NoSlot(WorkerId),

    #[error("Worker {0} is not connected")]
    WorkerGone(WorkerId),

    #[error("Failed to send assignment to worker {worker_id}: {reason}")]
    SendFailed { worker_id: WorkerId, reason: String },
}

/// What one scheduling pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: Vec<(TaskId, WorkerId)>,
    /// Tasks newly flagged as fitting no connected worker.
    pub unschedulable: Vec<TaskId>,
    /// Tasks left queued for lack of a free worker.
    pub deferred: usize,
    pub send_failures: usize,
}

/// Task scheduler.
pub struct Scheduler {
    registry: Arc<TaskRegistry>,
    workers: Arc<WorkerSet>,
    strategy: Arc<dyn DispatchStrategy>,
    send_timeout: Duration,
    trigger: Notify,
}

impl Scheduler {
    pub fn new(
        registry: Arc<TaskRegistry>,
        workers: Arc<WorkerSet>,
        strategy: Arc<dyn DispatchStrategy>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            workers,
            strategy,
            send_timeout,
            trigger: Notify::new(),
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Ask the scheduling loop for an immediate pass.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Run passes on `interval` and whenever triggered, until `shutdown`.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(strategy = self.strategy.name(), "Scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.trigger.notified() => {}
            }

            let report = self.tick().await;
            if !report.dispatched.is_empty() || report.send_failures > 0 {
                debug!(
                    dispatched = report.dispatched.len(),
                    deferred = report.deferred,
                    send_failures = report.send_failures,
                    "Scheduling pass"
                );
            }
        }
        info!("Scheduler stopped");
    }

    /// One scheduling pass over the queue in priority order.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let mut workers: Vec<WorkerSnapshot> = self
            .workers
            .snapshot()
            .await
            .into_iter()
            .filter(WorkerSnapshot::is_connected)
            .collect();

        for entry in self.registry.queued().await {
            if !workers.iter().any(|w| w.capacity().fits(&entry.resources)) {
                if self.registry.set_unschedulable(&entry.task_id, true).await {
                    report.unschedulable.push(entry.task_id.clone());
                }
                report.deferred += 1;
                continue;
            }
            self.registry.set_unschedulable(&entry.task_id, false).await;

            let candidates: Vec<WorkerSnapshot> = workers
                .iter()
                .filter(|w| w.has_free_slot() && w.capacity().fits(&entry.resources))
                .cloned()
                .collect();

            let Some(worker_id) = self.strategy.select(&entry.resources, &candidates) else {
                report.deferred += 1;
                continue;
            };

            match self.dispatch(&entry.task_id, &worker_id).await {
                Ok(_) => {
                    if let Some(w) = workers.iter_mut().find(|w| w.worker_id() == &worker_id) {
                        w.load += 1;
                        w.free_cpu = w.free_cpu.saturating_sub(entry.resources.max_cpu);
                        w.free_memory_mb =
                            w.free_memory_mb.saturating_sub(entry.resources.max_memory_mb);
                        w.assigned.push(entry.task_id.clone());
                    }
                    report.dispatched.push((entry.task_id, worker_id));
                }
                // Cancelled or removed since the snapshot.
                Err(SchedulerError::Task(_)) => {}
                Err(e) => {
                    warn!(
                        task_id = %entry.task_id,
                        worker_id = %worker_id,
                        error = %e,
                        "Dispatch failed, task stays queued"
                    );
                    report.send_failures += 1;
                    workers.retain(|w| w.worker_id() != &worker_id);
                }
            }
        }

        report
    }

    /// Send `task_id` to `worker_id` and mark it DISPATCHED.
    ///
    /// The worker slot is reserved before sending. If the send fails the
    /// slot is released and the task stays QUEUED.
    pub async fn dispatch(&self, task_id: &TaskId, worker_id: &WorkerId) -> Result<Task, SchedulerError> {
        let claim = self.registry.claim(task_id).await?;

        if !self
            .workers
            .assign(worker_id, task_id, claim.task().resources)
            .await
        {
            return Err(SchedulerError::NoSlot(worker_id.clone()));
        }

        match self.send_assignment(worker_id, claim.task()).await {
            Ok(()) => Ok(claim.commit(worker_id).await),
            Err(e) => {
                self.workers.release(worker_id, task_id).await;
                Err(e)
            }
        }
    }

    async fn send_assignment(&self, worker_id: &WorkerId, task: &Task) -> Result<(), SchedulerError> {
        let sender = self
            .workers
            .sender(worker_id)
            .await
            .ok_or_else(|| SchedulerError::WorkerGone(worker_id.clone()))?;

        let send_failed = |reason: String| SchedulerError::SendFailed {
            worker_id: worker_id.clone(),
            reason,
        };

        let (outbound, written) = Outbound::with_ack(Message::TaskSubmit(TaskSubmit::from(task)));
        let deliver = async {
            sender
                .send(outbound)
                .await
                .map_err(|_| send_failed("session closed".to_string()))?;
            written
                .await
                .map_err(|_| send_failed("session closed before writing".to_string()))?
                .map_err(|e| send_failed(e.to_string()))
        };

        tokio::time::timeout(self.send_timeout, deliver)
            .await
            .map_err(|_| send_failed("timed out".to_string()))?
    }
}
