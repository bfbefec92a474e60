//! Task registry: the authoritative task table and its state machine.
//!
//! Each task sits behind its own mutex, so transitions on unrelated tasks
//! never contend. A separate priority index orders QUEUED tasks by
//! (priority desc, submission sequence asc). Lock order is always task
//! first, then the index.
//!
//! Every applied transition is published on a broadcast channel for
//! observers and, when configured, on the persistence journal.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

use winlink_core::{
    Priority, ResourceLimits, Task, TaskError, TaskEvent, TaskEventKind, TaskId, TaskSpec,
    TaskStatus, TaskUpdate, WorkerCapacity, WorkerId,
};

/// Capacity of the observer broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<Priority>,
    seq: u64,
}

impl QueueKey {
    fn of(task: &Task) -> Self {
        Self {
            priority: Reverse(task.priority),
            seq: task.submit_seq,
        }
    }
}

/// Index entry for a QUEUED task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub priority: Priority,
    pub resources: ResourceLimits,
    pub submit_seq: u64,
}

impl QueuedTask {
    fn of(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            priority: task.priority,
            resources: task.resources,
            submit_seq: task.submit_seq,
        }
    }
}

/// Result of applying a worker update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update changed the task.
    Applied {
        previous: TaskStatus,
        current: TaskStatus,
    },
    /// Same terminal status reported again; nothing changed.
    Duplicate,
}

impl UpdateOutcome {
    /// Whether this update moved the task into a terminal state.
    pub fn reached_terminal(&self) -> bool {
        matches!(self, UpdateOutcome::Applied { previous, current }
            if current.is_terminal() && !previous.is_terminal())
    }
}

/// Result of a successful cancel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub previous: TaskStatus,
    /// Worker the task was bound to, if it had been dispatched.
    pub worker: Option<WorkerId>,
}

/// The master's task table.
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, Arc<Mutex<Task>>>>,
    queue: Mutex<BTreeMap<QueueKey, QueuedTask>>,
    next_seq: AtomicU64,
    events: broadcast::Sender<TaskEvent>,
    journal: Option<mpsc::UnboundedSender<TaskEvent>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tasks: RwLock::new(HashMap::new()),
            queue: Mutex::new(BTreeMap::new()),
            next_seq: AtomicU64::new(1),
            events,
            journal: None,
        }
    }

    /// Builder method to forward every event to a persistence journal.
    pub fn with_journal(mut self, journal: mpsc::UnboundedSender<TaskEvent>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Subscribe to the transition notification stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn emit(&self, kind: TaskEventKind, task: &Task) {
        let event = TaskEvent::new(kind, task);
        if let Some(journal) = &self.journal {
            let _ = journal.send(event.clone());
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn handle(&self, task_id: &TaskId) -> Result<Arc<Mutex<Task>>, TaskError> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| TaskError::TaskNotFound(task_id.clone()))
    }

    /// Insert a new task in QUEUED.
    ///
    /// Fails with `InvalidTask` if priority or resources are missing or
    /// malformed.
    pub async fn submit(&self, spec: TaskSpec) -> Result<TaskId, TaskError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let task = Task::from_spec(TaskId::generate(), spec, seq)?;
        let task_id = task.id.clone();

        // Held until the task is indexed, so a concurrent claim never sees
        // it half-inserted.
        let handle = Arc::new(Mutex::new(task));
        let task = handle.clone().lock_owned().await;
        self.tasks.write().await.insert(task_id.clone(), handle);
        self.queue
            .lock()
            .await
            .insert(QueueKey::of(&task), QueuedTask::of(&task));
        self.emit(TaskEventKind::Submitted, &task);

        info!(
            task_id = %task_id,
            name = %task.metadata.name,
            priority = %task.priority,
            "Task submitted"
        );
        Ok(task_id)
    }

    /// Apply a status report from the worker executing the task.
    ///
    /// Re-applying the terminal status a task already has is a no-op.
    /// Anything else aimed at a terminal task, at a task not bound to
    /// `reporter`, or at a task still QUEUED is `StaleUpdate`.
    pub async fn apply_update(
        &self,
        task_id: &TaskId,
        reporter: &WorkerId,
        update: TaskUpdate,
    ) -> Result<UpdateOutcome, TaskError> {
        let handle = self.handle(task_id).await?;
        let mut task = handle.lock().await;

        if task.status.is_terminal() {
            if task.status == update.status {
                debug!(task_id = %task_id, status = %update.status, "Duplicate terminal update");
                return Ok(UpdateOutcome::Duplicate);
            }
            return Err(TaskError::StaleUpdate {
                task_id: task_id.clone(),
                current: task.status,
            });
        }

        if task.status == TaskStatus::Queued || task.assigned_worker.as_ref() != Some(reporter) {
            return Err(TaskError::StaleUpdate {
                task_id: task_id.clone(),
                current: task.status,
            });
        }

        let previous = task.status;
        let next = update.status;
        // Returning to QUEUED is the registry's decision, never a worker's.
        if next == TaskStatus::Queued || !previous.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                task_id: task_id.clone(),
                from: previous,
                to: next,
            });
        }

        let now = Utc::now();
        task.status = next;
        task.progress = task.progress.max(update.progress.min(100));
        task.stdout.push_str(&update.stdout_delta);
        task.stderr.push_str(&update.stderr_delta);

        let kind = if next.is_terminal() {
            task.finished_at = Some(now);
            if update.error_reason.is_some() {
                task.error_reason = update.error_reason;
            }
            TaskEventKind::Finished
        } else if previous == TaskStatus::Dispatched {
            task.started_at = Some(now);
            TaskEventKind::Started
        } else {
            TaskEventKind::Progress
        };

        if kind != TaskEventKind::Progress {
            info!(
                task_id = %task_id,
                worker_id = %reporter,
                from = %previous,
                to = %next,
                "Task transition"
            );
        }
        self.emit(kind, &task);

        Ok(UpdateOutcome::Applied {
            previous,
            current: next,
        })
    }

    /// Cancel a task that has not finished.
    ///
    /// Returns the worker the task was bound to so the caller can tell it
    /// to stop.
    pub async fn cancel(&self, task_id: &TaskId, reason: &str) -> Result<CancelOutcome, TaskError> {
        let handle = self.handle(task_id).await?;
        let mut task = handle.lock().await;

        if task.status.is_terminal() {
            return Err(TaskError::AlreadyTerminal {
                task_id: task_id.clone(),
                status: task.status,
            });
        }

        let previous = task.status;
        if previous == TaskStatus::Queued {
            self.queue.lock().await.remove(&QueueKey::of(&task));
        }

        task.status = TaskStatus::Cancelled;
        task.finished_at = Some(Utc::now());
        task.error_reason = Some(if reason.is_empty() {
            "cancelled".to_string()
        } else {
            reason.to_string()
        });

        info!(task_id = %task_id, from = %previous, reason, "Task cancelled");
        self.emit(TaskEventKind::Finished, &task);

        Ok(CancelOutcome {
            previous,
            worker: task.assigned_worker.clone(),
        })
    }

    /// Highest-priority QUEUED task that fits `capabilities`, FIFO within
    /// a priority band.
    ///
    /// Does not change any state; binding happens through [`claim`](Self::claim).
    pub async fn dequeue_next(&self, capabilities: &WorkerCapacity) -> Option<Task> {
        let task_id = self
            .queue
            .lock()
            .await
            .values()
            .find(|entry| capabilities.fits(&entry.resources))
            .map(|entry| entry.task_id.clone())?;
        self.get(&task_id).await
    }

    /// Snapshot of the queue in dispatch order.
    pub async fn queued(&self) -> Vec<QueuedTask> {
        self.queue.lock().await.values().cloned().collect()
    }

    /// Lock a QUEUED task for dispatch.
    ///
    /// The task stays QUEUED until [`DispatchClaim::commit`] is called;
    /// dropping the claim releases it unchanged.
    pub async fn claim(&self, task_id: &TaskId) -> Result<DispatchClaim<'_>, TaskError> {
        let task = self.handle(task_id).await?.lock_owned().await;
        if task.status != TaskStatus::Queued {
            return Err(TaskError::NotQueued {
                task_id: task_id.clone(),
                status: task.status,
            });
        }
        Ok(DispatchClaim {
            registry: self,
            task,
        })
    }

    /// Return an active task to the queue after its worker was lost.
    ///
    /// Only applies if the task is still DISPATCHED/RUNNING on `worker`.
    /// Priority and submission sequence are preserved.
    pub async fn requeue(&self, task_id: &TaskId, worker: &WorkerId) -> Result<bool, TaskError> {
        let handle = self.handle(task_id).await?;
        let mut task = handle.lock().await;

        if !task.status.is_active() || task.assigned_worker.as_ref() != Some(worker) {
            return Ok(false);
        }

        let previous = task.status;
        task.reset_to_queued(Some(format!("requeued: worker {} lost", worker)));
        self.queue
            .lock()
            .await
            .insert(QueueKey::of(&task), QueuedTask::of(&task));

        info!(
            task_id = %task_id,
            worker_id = %worker,
            from = %previous,
            priority = %task.priority,
            "Task requeued"
        );
        self.emit(TaskEventKind::Requeued, &task);
        Ok(true)
    }

    /// Flag or clear the unschedulable condition on a QUEUED task.
    ///
    /// Returns true if the flag changed.
    pub async fn set_unschedulable(&self, task_id: &TaskId, unschedulable: bool) -> bool {
        let Ok(handle) = self.handle(task_id).await else {
            return false;
        };
        let mut task = handle.lock().await;
        if task.status != TaskStatus::Queued || task.unschedulable == unschedulable {
            return false;
        }
        task.unschedulable = unschedulable;
        if unschedulable {
            info!(
                task_id = %task_id,
                max_cpu = task.resources.max_cpu,
                max_memory_mb = task.resources.max_memory_mb,
                "No connected worker can fit task"
            );
            self.emit(TaskEventKind::Unschedulable, &task);
        }
        true
    }

    /// Load tasks recovered from history. Existing ids are skipped.
    pub async fn restore(&self, tasks: Vec<Task>) -> usize {
        let mut restored = 0;
        for mut task in tasks {
            if self.tasks.read().await.contains_key(&task.id) {
                continue;
            }
            if task.status != TaskStatus::Queued {
                task.reset_to_queued(task.error_reason.clone());
            }
            self.next_seq
                .fetch_max(task.submit_seq + 1, Ordering::SeqCst);
            self.queue
                .lock()
                .await
                .insert(QueueKey::of(&task), QueuedTask::of(&task));
            self.emit(TaskEventKind::Restored, &task);
            self.tasks
                .write()
                .await
                .insert(task.id.clone(), Arc::new(Mutex::new(task)));
            restored += 1;
        }
        restored
    }

    /// Drop a terminal task from the live table. Returns false for active
    /// or unknown tasks.
    pub async fn archive(&self, task_id: &TaskId) -> bool {
        let Ok(handle) = self.handle(task_id).await else {
            return false;
        };
        // Terminal is final, so the answer holds after the guard drops.
        let terminal = handle.lock().await.is_terminal();
        if !terminal {
            return false;
        }
        let mut tasks = self.tasks.write().await;
        if tasks.get(task_id).is_some_and(|current| Arc::ptr_eq(current, &handle)) {
            tasks.remove(task_id);
            debug!(task_id = %task_id, "Task archived");
        }
        true
    }

    pub async fn get(&self, task_id: &TaskId) -> Option<Task> {
        let handle = self.handle(task_id).await.ok()?;
        let task = handle.lock().await;
        Some(task.clone())
    }

    /// All tasks in submission order.
    pub async fn list(&self) -> Vec<Task> {
        let handles: Vec<_> = self.tasks.read().await.values().cloned().collect();
        let mut tasks = Vec::with_capacity(handles.len());
        for handle in handles {
            tasks.push(handle.lock().await.clone());
        }
        tasks.sort_by_key(|t| t.submit_seq);
        tasks
    }

    /// Number of tasks per status.
    pub async fn counts(&self) -> HashMap<TaskStatus, usize> {
        let mut counts: HashMap<TaskStatus, usize> =
            TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for task in self.list().await {
            *counts.entry(task.status).or_default() += 1;
        }
        counts
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive hold on a QUEUED task while it is being sent to a worker.
pub struct DispatchClaim<'a> {
    registry: &'a TaskRegistry,
    task: OwnedMutexGuard<Task>,
}

impl DispatchClaim<'_> {
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Mark the task DISPATCHED to `worker`. Call only after the send succeeded.
    pub async fn commit(mut self, worker: &WorkerId) -> Task {
        self.registry
            .queue
            .lock()
            .await
            .remove(&QueueKey::of(&self.task));

        self.task.status = TaskStatus::Dispatched;
        self.task.assigned_worker = Some(worker.clone());
        self.task.dispatch_count += 1;
        self.task.unschedulable = false;
        self.task.error_reason = None;

        info!(
            task_id = %self.task.id,
            worker_id = %worker,
            priority = %self.task.priority,
            "Task dispatched"
        );
        self.registry.emit(TaskEventKind::Dispatched, &self.task);
        self.task.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use winlink_core::Payload;

    fn spec(priority: Priority) -> TaskSpec {
        TaskSpec::new("t", Payload::code("sh", "echo hi"))
            .with_priority(priority)
            .with_resources(ResourceLimits::new(10, 128, 30))
    }

    fn big_caps() -> WorkerCapacity {
        WorkerCapacity::new(100, 4096, 4)
    }

    async fn dispatch(registry: &TaskRegistry, task_id: &TaskId, worker: &WorkerId) {
        registry.claim(task_id).await.unwrap().commit(worker).await;
    }

    async fn running(registry: &TaskRegistry, worker: &WorkerId) -> TaskId {
        let id = registry.submit(spec(Priority::Normal)).await.unwrap();
        dispatch(registry, &id, worker).await;
        registry
            .apply_update(&id, worker, TaskUpdate::new(TaskStatus::Running))
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_submit_starts_queued() {
        let registry = TaskRegistry::new();
        let id = registry.submit(spec(Priority::High)).await.unwrap();
        let task = registry.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.assigned_worker.is_none());
    }

    #[tokio::test]
    async fn test_submit_rejects_missing_fields() {
        let registry = TaskRegistry::new();
        let mut no_priority = spec(Priority::Low);
        no_priority.priority = None;
        assert!(matches!(
            registry.submit(no_priority).await,
            Err(TaskError::InvalidTask(_))
        ));

        let bad_limits = TaskSpec::new("t", Payload::code("sh", "x"))
            .with_priority(Priority::Low)
            .with_resources(ResourceLimits::new(10, 0, 30));
        assert!(matches!(
            registry.submit(bad_limits).await,
            Err(TaskError::InvalidTask(_))
        ));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_dequeue_order_priority_then_fifo() {
        let registry = TaskRegistry::new();
        let t1 = registry.submit(spec(Priority::Low)).await.unwrap();
        let t2 = registry.submit(spec(Priority::Critical)).await.unwrap();
        let t3 = registry.submit(spec(Priority::Normal)).await.unwrap();
        let t4 = registry.submit(spec(Priority::Critical)).await.unwrap();

        let worker = WorkerId::new("w1");
        let mut order = Vec::new();
        while let Some(task) = registry.dequeue_next(&big_caps()).await {
            order.push(task.id.clone());
            dispatch(&registry, &task.id, &worker).await;
        }
        assert_eq!(order, vec![t2, t4, t3, t1]);
    }

    #[tokio::test]
    async fn test_dequeue_does_not_mutate() {
        let registry = TaskRegistry::new();
        let id = registry.submit(spec(Priority::Normal)).await.unwrap();
        let first = registry.dequeue_next(&big_caps()).await.unwrap();
        let second = registry.dequeue_next(&big_caps()).await.unwrap();
        assert_eq!(first.id, id);
        assert_eq!(second.id, id);
        assert_eq!(second.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_dequeue_respects_capabilities() {
        let registry = TaskRegistry::new();
        let large = TaskSpec::new("big", Payload::code("sh", "x"))
            .with_priority(Priority::Critical)
            .with_resources(ResourceLimits::new(10, 8192, 30));
        registry.submit(large).await.unwrap();
        let small = registry.submit(spec(Priority::Low)).await.unwrap();

        let picked = registry.dequeue_next(&big_caps()).await.unwrap();
        assert_eq!(picked.id, small);
        assert!(registry
            .dequeue_next(&WorkerCapacity::new(5, 4096, 1))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_dropped_claim_leaves_task_queued() {
        let registry = TaskRegistry::new();
        let id = registry.submit(spec(Priority::Normal)).await.unwrap();
        {
            let claim = registry.claim(&id).await.unwrap();
            assert_eq!(claim.task().id, id);
        }
        assert_eq!(registry.get(&id).await.unwrap().status, TaskStatus::Queued);
        assert_eq!(registry.queued().await.len(), 1);
    }

    #[tokio::test]
    async fn test_full_lifecycle_with_monotone_progress() {
        let registry = TaskRegistry::new();
        let worker = WorkerId::new("w1");
        let id = running(&registry, &worker).await;

        for progress in [20, 60, 40] {
            registry
                .apply_update(
                    &id,
                    &worker,
                    TaskUpdate::new(TaskStatus::Running)
                        .with_progress(progress)
                        .with_output(format!("{progress}\n"), ""),
                )
                .await
                .unwrap();
        }
        assert_eq!(registry.get(&id).await.unwrap().progress, 60);

        let outcome = registry
            .apply_update(
                &id,
                &worker,
                TaskUpdate::new(TaskStatus::Succeeded).with_progress(100),
            )
            .await
            .unwrap();
        assert!(outcome.reached_terminal());

        let task = registry.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.progress, 100);
        assert_eq!(task.stdout, "20\n60\n40\n");
        assert!(task.started_at.is_some());
        assert!(task.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_progress_clamped() {
        let registry = TaskRegistry::new();
        let worker = WorkerId::new("w1");
        let id = running(&registry, &worker).await;
        registry
            .apply_update(&id, &worker, TaskUpdate::new(TaskStatus::Running).with_progress(250))
            .await
            .unwrap();
        assert_eq!(registry.get(&id).await.unwrap().progress, 100);
    }

    #[tokio::test]
    async fn test_identical_terminal_update_is_idempotent() {
        let registry = TaskRegistry::new();
        let worker = WorkerId::new("w1");
        let id = running(&registry, &worker).await;
        let done = TaskUpdate::new(TaskStatus::Failed)
            .with_output("", "boom\n")
            .with_error("exit code 1");

        registry.apply_update(&id, &worker, done.clone()).await.unwrap();
        let before = registry.get(&id).await.unwrap();
        let mut events = registry.subscribe();

        let again = registry.apply_update(&id, &worker, done).await.unwrap();
        assert_eq!(again, UpdateOutcome::Duplicate);
        assert_eq!(registry.get(&id).await.unwrap(), before);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_different_terminal_update_is_stale() {
        let registry = TaskRegistry::new();
        let worker = WorkerId::new("w1");
        let id = running(&registry, &worker).await;
        registry
            .apply_update(&id, &worker, TaskUpdate::new(TaskStatus::Succeeded))
            .await
            .unwrap();

        let result = registry
            .apply_update(&id, &worker, TaskUpdate::new(TaskStatus::Failed))
            .await;
        assert!(matches!(result, Err(TaskError::StaleUpdate { .. })));
        assert_eq!(
            registry.get(&id).await.unwrap().status,
            TaskStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_update_from_other_worker_is_stale() {
        let registry = TaskRegistry::new();
        let id = running(&registry, &WorkerId::new("w1")).await;
        let result = registry
            .apply_update(&id, &WorkerId::new("w2"), TaskUpdate::new(TaskStatus::Succeeded))
            .await;
        assert!(matches!(result, Err(TaskError::StaleUpdate { .. })));
    }

    #[tokio::test]
    async fn test_update_for_queued_task_is_stale() {
        let registry = TaskRegistry::new();
        let id = registry.submit(spec(Priority::Normal)).await.unwrap();
        let result = registry
            .apply_update(&id, &WorkerId::new("w1"), TaskUpdate::new(TaskStatus::Running))
            .await;
        assert!(matches!(result, Err(TaskError::StaleUpdate { .. })));
    }

    #[tokio::test]
    async fn test_running_cannot_be_skipped() {
        let registry = TaskRegistry::new();
        let worker = WorkerId::new("w1");
        let id = registry.submit(spec(Priority::Normal)).await.unwrap();
        dispatch(&registry, &id, &worker).await;

        for status in [TaskStatus::Succeeded, TaskStatus::TimedOut, TaskStatus::Queued] {
            let result = registry
                .apply_update(&id, &worker, TaskUpdate::new(status))
                .await;
            assert!(matches!(result, Err(TaskError::InvalidTransition { .. })), "{status}");
        }

        // Local policy rejection goes straight to FAILED.
        registry
            .apply_update(
                &id,
                &worker,
                TaskUpdate::new(TaskStatus::Failed).with_error("ResourceLimitExceeded: memory"),
            )
            .await
            .unwrap();
        let task = registry.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error_reason.as_deref(),
            Some("ResourceLimitExceeded: memory")
        );
    }

    #[tokio::test]
    async fn test_cancel_from_each_active_state() {
        let registry = TaskRegistry::new();
        let worker = WorkerId::new("w1");

        let queued = registry.submit(spec(Priority::Normal)).await.unwrap();
        let outcome = registry.cancel(&queued, "user").await.unwrap();
        assert_eq!(outcome.previous, TaskStatus::Queued);
        assert!(outcome.worker.is_none());
        assert!(registry.queued().await.is_empty());

        let dispatched = registry.submit(spec(Priority::Normal)).await.unwrap();
        dispatch(&registry, &dispatched, &worker).await;
        let outcome = registry.cancel(&dispatched, "user").await.unwrap();
        assert_eq!(outcome.worker, Some(worker.clone()));

        let run = running(&registry, &worker).await;
        let outcome = registry.cancel(&run, "").await.unwrap();
        assert_eq!(outcome.previous, TaskStatus::Running);
        assert_eq!(
            registry.get(&run).await.unwrap().status,
            TaskStatus::Cancelled
        );

        // The worker's own CANCELLED report afterwards is a duplicate.
        let echo = registry
            .apply_update(&run, &worker, TaskUpdate::new(TaskStatus::Cancelled))
            .await
            .unwrap();
        assert_eq!(echo, UpdateOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_cancel_terminal_fails() {
        let registry = TaskRegistry::new();
        let id = registry.submit(spec(Priority::Normal)).await.unwrap();
        registry.cancel(&id, "first").await.unwrap();
        assert!(matches!(
            registry.cancel(&id, "second").await,
            Err(TaskError::AlreadyTerminal { .. })
        ));
        assert!(matches!(
            registry.cancel(&TaskId::new("missing"), "x").await,
            Err(TaskError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_after_cancel_fails() {
        let registry = TaskRegistry::new();
        let id = registry.submit(spec(Priority::Normal)).await.unwrap();
        registry.cancel(&id, "user").await.unwrap();
        assert!(matches!(
            registry.claim(&id).await,
            Err(TaskError::NotQueued { .. })
        ));
    }

    #[tokio::test]
    async fn test_requeue_preserves_priority_and_order() {
        let registry = TaskRegistry::new();
        let worker = WorkerId::new("w1");
        let a = registry.submit(spec(Priority::High)).await.unwrap();
        let b = registry.submit(spec(Priority::High)).await.unwrap();
        dispatch(&registry, &a, &worker).await;
        let c = registry.submit(spec(Priority::High)).await.unwrap();

        assert!(registry.requeue(&a, &worker).await.unwrap());
        let order: Vec<_> = registry.queued().await.into_iter().map(|q| q.task_id).collect();
        assert_eq!(order, vec![a.clone(), b, c]);

        let task = registry.get(&a).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.dispatch_count, 1);
        assert!(task.assigned_worker.is_none());
    }

    #[tokio::test]
    async fn test_requeue_ignores_other_workers_and_terminal_tasks() {
        let registry = TaskRegistry::new();
        let worker = WorkerId::new("w1");
        let id = running(&registry, &worker).await;
        assert!(!registry.requeue(&id, &WorkerId::new("w2")).await.unwrap());

        registry
            .apply_update(&id, &worker, TaskUpdate::new(TaskStatus::Succeeded))
            .await
            .unwrap();
        assert!(!registry.requeue(&id, &worker).await.unwrap());
    }

    #[tokio::test]
    async fn test_events_emitted_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = TaskRegistry::new().with_journal(tx);
        let worker = WorkerId::new("w1");
        let id = running(&registry, &worker).await;
        registry
            .apply_update(&id, &worker, TaskUpdate::new(TaskStatus::Succeeded))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(
            kinds,
            vec![
                TaskEventKind::Submitted,
                TaskEventKind::Dispatched,
                TaskEventKind::Started,
                TaskEventKind::Finished,
            ]
        );
    }

    #[tokio::test]
    async fn test_unschedulable_flag() {
        let registry = TaskRegistry::new();
        let id = registry.submit(spec(Priority::Normal)).await.unwrap();
        assert!(registry.set_unschedulable(&id, true).await);
        assert!(!registry.set_unschedulable(&id, true).await);
        assert!(registry.get(&id).await.unwrap().unschedulable);
        assert!(registry.set_unschedulable(&id, false).await);
    }

    #[tokio::test]
    async fn test_restore_continues_sequence() {
        let registry = TaskRegistry::new();
        let mut task = Task::from_spec(TaskId::new("old"), spec(Priority::Low), 41).unwrap();
        task.status = TaskStatus::Running;
        task.assigned_worker = Some(WorkerId::new("w1"));

        assert_eq!(registry.restore(vec![task.clone()]).await, 1);
        assert_eq!(registry.restore(vec![task]).await, 0);

        let restored = registry.get(&TaskId::new("old")).await.unwrap();
        assert_eq!(restored.status, TaskStatus::Queued);
        assert_eq!(restored.submit_seq, 41);

        let new_id = registry.submit(spec(Priority::Low)).await.unwrap();
        assert_eq!(registry.get(&new_id).await.unwrap().submit_seq, 42);
    }

    #[tokio::test]
    async fn test_archive_only_terminal() {
        let registry = TaskRegistry::new();
        let id = registry.submit(spec(Priority::Normal)).await.unwrap();
        assert!(!registry.archive(&id).await);
        registry.cancel(&id, "done").await.unwrap();
        assert!(registry.archive(&id).await);
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_archive_waits_for_busy_task() {
        let registry = Arc::new(TaskRegistry::new());
        let id = registry.submit(spec(Priority::Normal)).await.unwrap();
        registry.cancel(&id, "done").await.unwrap();

        let handle = registry.handle(&id).await.unwrap();
        let reader = handle.lock().await;
        let archiving = tokio::spawn({
            let registry = registry.clone();
            let id = id.clone();
            async move { registry.archive(&id).await }
        });
        tokio::task::yield_now().await;
        assert!(!archiving.is_finished());
        assert_eq!(registry.len().await, 1);

        drop(reader);
        assert!(archiving.await.unwrap());
        assert!(registry.get(&id).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_submitted_task_visible_to_event_observers() {
        let registry = Arc::new(TaskRegistry::new());
        let mut events = registry.subscribe();
        let submitting = tokio::spawn({
            let registry = registry.clone();
            async move { registry.submit(spec(Priority::High)).await.unwrap() }
        });

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, TaskEventKind::Submitted);
        let task = registry.get(&event.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(
            registry.dequeue_next(&big_caps()).await.unwrap().id,
            event.task_id
        );
        assert_eq!(submitting.await.unwrap(), event.task_id);
    }
}
