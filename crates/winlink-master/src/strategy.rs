//! Load-balancing strategies.
//!
//! A strategy picks one worker from candidates the scheduler has already
//! filtered to connected workers with a free slot whose declared capacity
//! fits the task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use winlink_core::{ResourceLimits, WorkerId};

use crate::workers::WorkerSnapshot;

/// Chooses a worker for a task.
pub trait DispatchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick a worker from `candidates`, or `None` if none is acceptable.
    fn select(&self, limits: &ResourceLimits, candidates: &[WorkerSnapshot]) -> Option<WorkerId>;
}

/// Strategy selection for configuration and the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RoundRobin,
    #[default]
    LeastLoaded,
    ResourceAware,
    Performance,
}

impl StrategyKind {
    pub fn build(self) -> Arc<dyn DispatchStrategy> {
        match self {
            StrategyKind::RoundRobin => Arc::new(RoundRobin::default()),
            StrategyKind::LeastLoaded => Arc::new(LeastLoaded),
            StrategyKind::ResourceAware => Arc::new(ResourceAware),
            StrategyKind::Performance => Arc::new(Performance),
        }
    }
}

/// Next worker in rotation, in worker id order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl DispatchStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, _limits: &ResourceLimits, candidates: &[WorkerSnapshot]) -> Option<WorkerId> {
        if candidates.is_empty() {
            return None;
        }
        let mut ordered: Vec<&WorkerSnapshot> = candidates.iter().collect();
        ordered.sort_by(|a, b| a.worker_id().cmp(b.worker_id()));

        let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(ordered[turn % ordered.len()].worker_id().clone())
    }
}

/// Lowest load-to-slots ratio, ties broken by worker id.
#[derive(Debug, Default)]
pub struct LeastLoaded;

fn least_loaded<'a>(candidates: impl Iterator<Item = &'a WorkerSnapshot>) -> Option<WorkerId> {
    candidates
        .min_by(|a, b| {
            a.load_ratio()
                .total_cmp(&b.load_ratio())
                .then_with(|| a.worker_id().cmp(b.worker_id()))
        })
        .map(|w| w.worker_id().clone())
}

impl DispatchStrategy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least_loaded"
    }

    fn select(&self, _limits: &ResourceLimits, candidates: &[WorkerSnapshot]) -> Option<WorkerId> {
        least_loaded(candidates.iter())
    }
}

/// Workers whose free CPU and memory cover the task, then least loaded.
#[derive(Debug, Default)]
pub struct ResourceAware;

impl DispatchStrategy for ResourceAware {
    fn name(&self) -> &'static str {
        "resource_aware"
    }

    fn select(&self, limits: &ResourceLimits, candidates: &[WorkerSnapshot]) -> Option<WorkerId> {
        least_loaded(candidates.iter().filter(|w| w.has_free_resources(limits)))
    }
}

/// Run time at which a worker earns no speed credit.
const SLOW_TASK_SECS: f64 = 300.0;
/// Run time at which the response term of the load score saturates.
const RESPONSE_SATURATION_SECS: f64 = 60.0;

/// Best track record for the least load.
///
/// The load score blends host CPU and memory (from the latest usage sample),
/// slot occupancy and average run time, scaled up for unreliable workers.
/// The performance term averages success rate, speed and free slots. The
/// highest `0.3 * performance - load` wins, ties broken by worker id.
#[derive(Debug, Default)]
pub struct Performance;

impl Performance {
    pub fn score(worker: &WorkerSnapshot) -> f64 {
        let perf = &worker.performance;
        let slots = worker.load_ratio().min(1.0);
        let (cpu, memory) = worker
            .usage
            .map(|u| (u.cpu_percent as f64 / 100.0, u.memory_percent as f64 / 100.0))
            .unwrap_or((0.0, 0.0));
        let response = (perf.avg_duration_secs / RESPONSE_SATURATION_SECS).min(1.0);

        let load = (0.3 * cpu + 0.25 * memory + 0.25 * slots + 0.2 * response)
            / perf.success_rate.max(0.1);
        let speed = 1.0 - (perf.avg_duration_secs / SLOW_TASK_SECS).min(1.0);
        let performance = (perf.success_rate + speed + (1.0 - slots)) / 3.0;

        0.3 * performance - load
    }
}

impl DispatchStrategy for Performance {
    fn name(&self) -> &'static str {
        "performance"
    }

    fn select(&self, _limits: &ResourceLimits, candidates: &[WorkerSnapshot]) -> Option<WorkerId> {
        candidates
            .iter()
            .map(|w| (Self::score(w), w))
            .max_by(|(a_score, a), (b_score, b)| {
                a_score
                    .total_cmp(b_score)
                    .then_with(|| b.worker_id().cmp(a.worker_id()))
            })
            .map(|(_, w)| w.worker_id().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use winlink_core::{ConnectionState, ResourceUsage, WorkerCapacity, WorkerInfo};

    use crate::workers::WorkerPerformance;

    fn worker(id: &str, load: u32, slots: u32, free_cpu: u32, free_memory_mb: u64) -> WorkerSnapshot {
        WorkerSnapshot {
            info: WorkerInfo::new(WorkerId::new(id), "host")
                .with_capacity(WorkerCapacity::new(100, 4096, slots)),
            state: ConnectionState::Connected,
            load,
            free_cpu,
            free_memory_mb,
            usage: None,
            performance: WorkerPerformance::default(),
            last_heartbeat: Utc::now(),
            assigned: vec![],
        }
    }

    fn limits() -> ResourceLimits {
        ResourceLimits::new(50, 1024, 10)
    }

    #[test]
    fn test_round_robin_rotates_in_id_order() {
        let strategy = RoundRobin::default();
        let workers = vec![worker("b", 0, 2, 100, 4096), worker("a", 0, 2, 100, 4096)];
        let picks: Vec<_> = (0..3)
            .map(|_| strategy.select(&limits(), &workers).unwrap())
            .collect();
        assert_eq!(
            picks,
            vec![WorkerId::new("a"), WorkerId::new("b"), WorkerId::new("a")]
        );
        assert!(strategy.select(&limits(), &[]).is_none());
    }

    #[test]
    fn test_least_loaded_uses_ratio() {
        // 2/4 = 0.5 beats 1/1 = 1.0 even though its absolute load is higher.
        let workers = vec![worker("a", 1, 1, 100, 4096), worker("b", 2, 4, 100, 4096)];
        assert_eq!(
            LeastLoaded.select(&limits(), &workers),
            Some(WorkerId::new("b"))
        );
    }

    #[test]
    fn test_least_loaded_tie_breaks_by_id() {
        let workers = vec![worker("z", 1, 2, 100, 4096), worker("m", 1, 2, 100, 4096)];
        assert_eq!(
            LeastLoaded.select(&limits(), &workers),
            Some(WorkerId::new("m"))
        );
    }

    #[test]
    fn test_resource_aware_filters_on_free_resources() {
        let workers = vec![
            worker("a", 0, 4, 40, 4096),
            worker("b", 3, 4, 100, 4096),
            worker("c", 1, 4, 100, 512),
        ];
        assert_eq!(
            ResourceAware.select(&limits(), &workers),
            Some(WorkerId::new("b"))
        );
        assert!(ResourceAware
            .select(&ResourceLimits::new(100, 8192, 1), &workers)
            .is_none());
    }

    #[test]
    fn test_kind_builds_named_strategy() {
        assert_eq!(StrategyKind::RoundRobin.build().name(), "round_robin");
        assert_eq!(StrategyKind::default().build().name(), "least_loaded");
        assert_eq!(StrategyKind::ResourceAware.build().name(), "resource_aware");
        assert_eq!(StrategyKind::Performance.build().name(), "performance");
    }

    #[test]
    fn test_performance_prefers_reliable_worker() {
        let mut flaky = worker("a", 0, 2, 100, 4096);
        for _ in 0..10 {
            flaky.performance.record(false, Some(Duration::from_secs(5)));
        }
        let mut steady = worker("b", 0, 2, 100, 4096);
        steady.performance.record(true, Some(Duration::from_secs(5)));

        assert_eq!(
            Performance.select(&limits(), &[flaky, steady]),
            Some(WorkerId::new("b"))
        );
    }

    #[test]
    fn test_performance_penalizes_slow_and_busy_hosts() {
        let mut slow = worker("a", 0, 2, 100, 4096);
        slow.performance.record(true, Some(Duration::from_secs(600)));
        let fast = worker("b", 0, 2, 100, 4096);
        assert_eq!(
            Performance.select(&limits(), &[slow, fast.clone()]),
            Some(WorkerId::new("b"))
        );

        let mut busy = worker("c", 0, 2, 100, 4096);
        busy.usage = Some(ResourceUsage {
            cpu_percent: 95.0,
            memory_percent: 90.0,
            memory_available_mb: 100,
            disk_percent: 50.0,
            disk_free_mb: 1000,
            active_tasks: 0,
        });
        assert_eq!(
            Performance.select(&limits(), &[busy, fast]),
            Some(WorkerId::new("b"))
        );
    }

    #[test]
    fn test_performance_tie_breaks_by_id() {
        let workers = vec![worker("z", 0, 2, 100, 4096), worker("m", 0, 2, 100, 4096)];
        assert_eq!(
            Performance.select(&limits(), &workers),
            Some(WorkerId::new("m"))
        );
        assert!(Performance.select(&limits(), &[]).is_none());
    }
}
