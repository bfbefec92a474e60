//! Host resource sampling for heartbeats.

use std::sync::Mutex;

use sysinfo::{Disks, System};
use tracing::warn;

use winlink_core::ResourceUsage;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Samples CPU, memory and disk usage of the worker host.
///
/// CPU usage is measured between consecutive samples, so the first sample
/// after creation reports the usage since the sampler was built.
#[derive(Debug)]
pub struct UsageSampler {
    system: Mutex<System>,
}

impl UsageSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }

    pub fn sample(&self, active_tasks: u32) -> Option<ResourceUsage> {
        let Ok(mut system) = self.system.lock() else {
            warn!("Usage sampler poisoned, skipping sample");
            return None;
        };
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total_memory = system.total_memory();
        let available_memory = system.available_memory();

        let disks = Disks::new_with_refreshed_list();
        let total_space: u64 = disks.iter().map(|disk| disk.total_space()).sum();
        let free_space: u64 = disks.iter().map(|disk| disk.available_space()).sum();

        Some(ResourceUsage {
            cpu_percent: round2(system.global_cpu_usage()),
            memory_percent: percent_used(total_memory, available_memory),
            memory_available_mb: available_memory / BYTES_PER_MB,
            disk_percent: percent_used(total_space, free_space),
            disk_free_mb: free_space / BYTES_PER_MB,
            active_tasks,
        })
    }
}

impl Default for UsageSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn percent_used(total: u64, free: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    let used = total.saturating_sub(free) as f64;
    round2((used / total as f64 * 100.0) as f32)
}

fn round2(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_used() {
        assert_eq!(percent_used(0, 0), 0.0);
        assert_eq!(percent_used(200, 50), 75.0);
        assert_eq!(percent_used(3, 2), 33.33);
        assert_eq!(percent_used(10, 20), 0.0);
    }

    #[test]
    fn test_sample_reports_host_figures() {
        let sampler = UsageSampler::new();
        let usage = sampler.sample(2).unwrap();
        assert_eq!(usage.active_tasks, 2);
        assert!((0.0..=100.0).contains(&usage.memory_percent));
        assert!((0.0..=100.0).contains(&usage.disk_percent));
        assert!(usage.cpu_percent >= 0.0);
    }
}
