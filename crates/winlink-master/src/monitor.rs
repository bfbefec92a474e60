//! Worker liveness monitor.
//!
//! Marks silent workers DISCONNECTED once they miss enough heartbeats, and
//! requeues the tasks of workers that stay away past the grace period.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::state::MasterState;

/// Result of one monitor pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub reaped: usize,
    pub requeued: usize,
}

/// Expire silent workers, then reap those past the grace period.
pub async fn sweep(state: &MasterState) -> SweepReport {
    let expired = state
        .workers
        .expire_stale(state.config.heartbeat_timeout())
        .await;

    let reaped = state.workers.reap(state.config.grace_period()).await;
    let mut requeued = 0;
    for (worker_id, tasks) in &reaped {
        requeued += state.requeue_from(worker_id, tasks).await;
    }

    SweepReport {
        expired: expired.len(),
        reaped: reaped.len(),
        requeued,
    }
}

/// Run [`sweep`] periodically until `shutdown`.
pub async fn run(state: Arc<MasterState>, shutdown: CancellationToken) {
    // Sweep at least twice per heartbeat so expiry lags by under half an interval.
    let period = (state.config.heartbeat_interval() / 2).max(Duration::from_millis(100));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(period_ms = period.as_millis() as u64, "Worker monitor started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let report = sweep(&state).await;
        if report != SweepReport::default() {
            debug!(
                expired = report.expired,
                reaped = report.reaped,
                requeued = report.requeued,
                "Monitor pass"
            );
        }
    }
    info!("Worker monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use winlink_core::{
        Payload, Priority, ResourceLimits, TaskSpec, TaskStatus, TaskUpdate, WorkerCapacity,
        WorkerId, WorkerInfo,
    };

    use crate::config::MasterConfig;
    use crate::registry::TaskRegistry;

    fn config(grace_secs: u64) -> MasterConfig {
        MasterConfig {
            heartbeat_interval_secs: 1,
            missed_heartbeats: 1,
            grace_period_secs: grace_secs,
            ..MasterConfig::default()
        }
    }

    #[tokio::test]
    async fn test_running_tasks_requeued_after_grace() {
        let state = MasterState::new(config(0), TaskRegistry::new());
        let w1 = WorkerId::new("w1");
        let (tx, _rx) = mpsc::channel(8);
        let registration = state
            .workers
            .register(
                WorkerInfo::new(w1.clone(), "host").with_capacity(WorkerCapacity::new(100, 4096, 4)),
                tx,
                &[],
            )
            .await;

        let limits = ResourceLimits::new(10, 64, 60);
        let mut ids = Vec::new();
        for priority in [Priority::Low, Priority::High] {
            let id = state
                .submit_task(
                    TaskSpec::new("job", Payload::code("sh", "sleep 60"))
                        .with_priority(priority)
                        .with_resources(limits),
                )
                .await
                .unwrap();
            assert!(state.workers.assign(&w1, &id, limits).await);
            state.registry.claim(&id).await.unwrap().commit(&w1).await;
            state
                .registry
                .apply_update(&id, &w1, TaskUpdate::new(TaskStatus::Running))
                .await
                .unwrap();
            ids.push(id);
        }
        state
            .workers
            .mark_disconnected(&w1, registration.session)
            .await;

        let report = sweep(&state).await;
        assert_eq!(report.reaped, 1);
        assert_eq!(report.requeued, 2);
        assert!(state.workers.is_empty().await);

        let queued = state.registry.queued().await;
        let order: Vec<_> = queued.iter().map(|q| q.task_id.clone()).collect();
        assert_eq!(order, vec![ids[1].clone(), ids[0].clone()]);
        for id in &ids {
            let task = state.registry.get(id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Queued);
            assert!(task.assigned_worker.is_none());
        }
        assert_eq!(queued[0].priority, Priority::High);
        assert_eq!(queued[1].priority, Priority::Low);
        assert!(queued[1].submit_seq < queued[0].submit_seq);
    }

    #[tokio::test]
    async fn test_tasks_kept_within_grace() {
        let state = MasterState::new(config(3600), TaskRegistry::new());
        let w1 = WorkerId::new("w1");
        let (tx, _rx) = mpsc::channel(8);
        let registration = state
            .workers
            .register(WorkerInfo::new(w1.clone(), "host"), tx, &[])
            .await;
        let id = state
            .submit_task(TaskSpec::new("job", Payload::code("sh", "true")))
            .await
            .unwrap();
        state.registry.claim(&id).await.unwrap().commit(&w1).await;

        state
            .workers
            .mark_disconnected(&w1, registration.session)
            .await;
        let report = sweep(&state).await;
        assert_eq!(report.reaped, 0);
        assert_eq!(
            state.registry.get(&id).await.unwrap().status,
            TaskStatus::Dispatched
        );
    }

    #[tokio::test]
    async fn test_silent_worker_expires() {
        let mut config = config(3600);
        config.missed_heartbeats = 0;
        let state = MasterState::new(config, TaskRegistry::new());
        let w1 = WorkerId::new("w1");
        let (tx, mut rx) = mpsc::channel(8);
        state
            .workers
            .register(WorkerInfo::new(w1.clone(), "host"), tx, &[])
            .await;

        let report = sweep(&state).await;
        assert_eq!(report.expired, 1);
        assert!(!state.workers.get(&w1).await.unwrap().is_connected());
        // Outbound channel closed, so the session loop ends.
        assert!(rx.recv().await.is_none());
    }
}
