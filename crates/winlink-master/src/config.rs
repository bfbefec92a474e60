//! Master configuration.
//!
//! Every field has a default; a JSON file may override any subset, and the
//! command line overrides the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use winlink_core::{Priority, ResourceLimits};
use winlink_proto::discovery::DEFAULT_DISCOVERY_PORT;
use winlink_proto::{RetryPolicy, TlsPaths};

use crate::strategy::StrategyKind;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Master configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Host the worker listener binds to.
    pub listen_host: String,

    /// First port tried for the worker listener.
    pub port_range_start: u16,

    /// Last port tried for the worker listener.
    pub port_range_end: u16,

    /// HTTP admin API bind address; disabled when `None`.
    pub http_addr: Option<String>,

    /// Expected heartbeat interval from workers (seconds).
    pub heartbeat_interval_secs: u64,

    /// Missed intervals before a worker is marked DISCONNECTED.
    pub missed_heartbeats: u32,

    /// Time a DISCONNECTED worker keeps its tasks before they are requeued (seconds).
    pub grace_period_secs: u64,

    /// Budget for a new connection to send `register` (seconds).
    pub register_timeout_secs: u64,

    /// Consecutive authentication failures tolerated per connection.
    pub max_auth_failures: u32,

    /// Limits applied to submissions that omit them.
    pub default_resources: ResourceLimits,

    /// Priority applied to submissions that omit it.
    pub default_priority: Priority,

    /// Load-balancing strategy.
    pub strategy: StrategyKind,

    /// Scheduler tick interval (milliseconds).
    pub schedule_interval_ms: u64,

    /// Time allowed for a `task_submit` to reach the wire (milliseconds).
    pub dispatch_send_timeout_ms: u64,

    /// Retry policy for history writes.
    pub persistence_retry: RetryPolicy,

    /// JSON-lines history file; in-memory history when `None`.
    pub history_path: Option<PathBuf>,

    /// Record dispatch/start/requeue transitions, not only submissions and terminal states.
    pub record_intermediate: bool,

    /// Keep terminal tasks in the registry after they are recorded.
    pub retain_terminal: bool,

    /// Age after which finished tasks and usage samples are pruned (days);
    /// kept forever when `None`.
    pub history_retention_days: Option<u64>,

    /// Listen for worker beacons.
    pub discovery_enabled: bool,

    /// UDP port for worker beacons.
    pub discovery_port: u16,

    /// Beacons older than this are pruned from the discovered list (seconds).
    pub discovery_stale_secs: u64,

    /// Shared secret for envelope authentication.
    pub secret_path: PathBuf,

    /// Master certificate, key and CA.
    pub tls: TlsPaths,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            port_range_start: 9000,
            port_range_end: 9010,
            http_addr: Some("127.0.0.1:9080".to_string()),
            heartbeat_interval_secs: 30,
            missed_heartbeats: 3,
            grace_period_secs: 60,
            register_timeout_secs: 10,
            max_auth_failures: winlink_proto::connection::DEFAULT_MAX_AUTH_FAILURES,
            default_resources: ResourceLimits::default(),
            default_priority: Priority::Normal,
            strategy: StrategyKind::LeastLoaded,
            schedule_interval_ms: 1_000,
            dispatch_send_timeout_ms: 5_000,
            persistence_retry: RetryPolicy::default(),
            history_path: Some(PathBuf::from("data/history.jsonl")),
            record_intermediate: false,
            retain_terminal: true,
            history_retention_days: Some(30),
            discovery_enabled: true,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            discovery_stale_secs: 15,
            secret_path: PathBuf::from("secrets/auth_token.txt"),
            tls: TlsPaths {
                ca_cert_path: PathBuf::from("certs/ca.crt"),
                cert_path: PathBuf::from("certs/master.crt"),
                key_path: PathBuf::from("certs/master.key"),
            },
        }
    }
}

impl MasterConfig {
    /// Load from a JSON file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            None => Self::default(),
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_range_start > self.port_range_end {
            return Err(ConfigError::Invalid(format!(
                "port range {}..={} is empty",
                self.port_range_start, self.port_range_end
            )));
        }
        if self.heartbeat_interval_secs == 0 || self.missed_heartbeats == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat interval and missed threshold must be positive".to_string(),
            ));
        }
        self.default_resources
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("default_resources: {}", e)))?;
        self.persistence_retry
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("persistence_retry: {}", e)))?;
        if self.history_retention_days == Some(0) {
            return Err(ConfigError::Invalid(
                "history_retention_days must be positive or null".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Silence after which a worker is marked DISCONNECTED.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.missed_heartbeats
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_secs(self.register_timeout_secs)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms)
    }

    pub fn dispatch_send_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_send_timeout_ms)
    }

    pub fn discovery_stale(&self) -> Duration {
        Duration::from_secs(self.discovery_stale_secs)
    }

    pub fn history_retention(&self) -> Option<Duration> {
        self.history_retention_days
            .map(|days| Duration::from_secs(days.saturating_mul(24 * 3600)))
    }
}
