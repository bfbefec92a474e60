//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use winlink_core::{ConnectionState, TaskStatus};

use crate::state::MasterState;

/// Event counters that cannot be derived from current state.
#[derive(Debug, Default)]
pub struct Counters {
    pub stale_updates: AtomicU64,
    pub rejected_registrations: AtomicU64,
    pub requeued_tasks: AtomicU64,
    pub dropped_connections: AtomicU64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Collect all metrics from the master state and format as Prometheus text.
pub async fn collect_metrics(state: &MasterState) -> String {
    let mut output = String::new();

    collect_worker_metrics(state, &mut output).await;
    collect_task_metrics(state, &mut output).await;
    collect_counters(state, &mut output);

    output
}

async fn collect_worker_metrics(state: &MasterState, output: &mut String) {
    let workers = state.workers.snapshot().await;
    let connected = workers
        .iter()
        .filter(|w| w.state == ConnectionState::Connected)
        .count();
    let disconnected = workers.len() - connected;
    let load: u32 = workers.iter().map(|w| w.load).sum();
    let slots: u32 = workers
        .iter()
        .filter(|w| w.is_connected())
        .map(|w| w.capacity().max_tasks)
        .sum();

    writeln!(output, "# HELP winlink_workers Known workers by connection state").ok();
    writeln!(output, "# TYPE winlink_workers gauge").ok();
    writeln!(output, "winlink_workers{{state=\"connected\"}} {connected}").ok();
    writeln!(output, "winlink_workers{{state=\"disconnected\"}} {disconnected}").ok();

    writeln!(output).ok();
    writeln!(output, "# HELP winlink_worker_load Tasks attributed to workers").ok();
    writeln!(output, "# TYPE winlink_worker_load gauge").ok();
    writeln!(output, "winlink_worker_load {load}").ok();

    writeln!(output).ok();
    writeln!(output, "# HELP winlink_worker_slots Task slots on connected workers").ok();
    writeln!(output, "# TYPE winlink_worker_slots gauge").ok();
    writeln!(output, "winlink_worker_slots {slots}").ok();

    let reporting: Vec<_> = workers
        .iter()
        .filter_map(|w| w.usage.map(|u| (w.worker_id(), u)))
        .collect();
    if !reporting.is_empty() {
        writeln!(output).ok();
        writeln!(output, "# HELP winlink_worker_cpu_percent Host CPU usage from the last heartbeat").ok();
        writeln!(output, "# TYPE winlink_worker_cpu_percent gauge").ok();
        for (id, usage) in &reporting {
            writeln!(output, "winlink_worker_cpu_percent{{worker=\"{id}\"}} {}", usage.cpu_percent).ok();
        }
        writeln!(output).ok();
        writeln!(output, "# HELP winlink_worker_memory_percent Host memory usage from the last heartbeat").ok();
        writeln!(output, "# TYPE winlink_worker_memory_percent gauge").ok();
        for (id, usage) in &reporting {
            writeln!(output, "winlink_worker_memory_percent{{worker=\"{id}\"}} {}", usage.memory_percent).ok();
        }
    }

    writeln!(output).ok();
    writeln!(output, "# HELP winlink_discovered_workers Workers seen by beacon").ok();
    writeln!(output, "# TYPE winlink_discovered_workers gauge").ok();
    writeln!(output, "winlink_discovered_workers {}", state.discovered.len().await).ok();
}

async fn collect_task_metrics(state: &MasterState, output: &mut String) {
    let counts = state.registry.counts().await;
    let tasks = state.registry.list().await;
    let unschedulable = tasks.iter().filter(|t| t.unschedulable).count();
    let dispatches: u64 = tasks.iter().map(|t| t.dispatch_count as u64).sum();

    writeln!(output).ok();
    writeln!(output, "# HELP winlink_tasks Tasks in the registry by status").ok();
    writeln!(output, "# TYPE winlink_tasks gauge").ok();
    for status in TaskStatus::ALL {
        let count = counts.get(&status).copied().unwrap_or(0);
        writeln!(output, "winlink_tasks{{status=\"{}\"}} {count}", status.as_str()).ok();
    }

    writeln!(output).ok();
    writeln!(output, "# HELP winlink_tasks_unschedulable Queued tasks no connected worker can fit").ok();
    writeln!(output, "# TYPE winlink_tasks_unschedulable gauge").ok();
    writeln!(output, "winlink_tasks_unschedulable {unschedulable}").ok();

    writeln!(output).ok();
    writeln!(output, "# HELP winlink_task_dispatches Dispatches of tasks in the registry").ok();
    writeln!(output, "# TYPE winlink_task_dispatches gauge").ok();
    writeln!(output, "winlink_task_dispatches {dispatches}").ok();
}

fn collect_counters(state: &MasterState, output: &mut String) {
    let counters = [
        (
            "winlink_stale_updates_total",
            "Worker updates rejected as stale",
            &state.counters.stale_updates,
        ),
        (
            "winlink_rejected_registrations_total",
            "Registrations refused",
            &state.counters.rejected_registrations,
        ),
        (
            "winlink_requeued_tasks_total",
            "Tasks returned to the queue after worker loss",
            &state.counters.requeued_tasks,
        ),
        (
            "winlink_dropped_connections_total",
            "Connections closed for authentication or protocol violations",
            &state.counters.dropped_connections,
        ),
    ];

    for (name, help, value) in counters {
        writeln!(output).ok();
        writeln!(output, "# HELP {name} {help}").ok();
        writeln!(output, "# TYPE {name} counter").ok();
        writeln!(output, "{name} {}", value.load(Ordering::Relaxed)).ok();
    }
}
