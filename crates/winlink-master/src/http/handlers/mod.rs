//! HTTP request handlers.

mod events;
mod health;
mod stats;
mod tasks;
mod workers;

pub use events::stream_events;
pub use health::{health_check, metrics_handler};
pub use stats::{get_stats, worker_usage};
pub use tasks::{cancel_task, get_task, list_tasks, submit_task};
pub use workers::{list_discovered, list_workers};
