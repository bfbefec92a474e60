//! Worker configuration.
//!
//! Loaded from an optional JSON file; every field has a default and the
//! command line overrides individual values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use winlink_core::{validate_worker_id_format, ResourceLimits, TaskError, WorkerCapacity, WorkerId};
use winlink_proto::discovery::DEFAULT_DISCOVERY_PORT;
use winlink_proto::{RetryPolicy, TlsPaths};

use crate::templates;

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

/// Largest limits this worker accepts for a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalPolicy {
    pub max_cpu: u32,
    pub max_memory_mb: u64,
    pub max_timeout_s: u64,
}

impl Default for LocalPolicy {
    fn default() -> Self {
        Self {
            max_cpu: 100,
            max_memory_mb: 2048,
            max_timeout_s: 3600,
        }
    }
}

impl LocalPolicy {
    /// Reject limits above the local maximums.
    pub fn check(&self, limits: &ResourceLimits) -> Result<(), TaskError> {
        if limits.max_cpu > self.max_cpu {
            return Err(TaskError::ResourceLimitExceeded(format!(
                "max_cpu {} exceeds local maximum {}",
                limits.max_cpu, self.max_cpu
            )));
        }
        if limits.max_memory_mb > self.max_memory_mb {
            return Err(TaskError::ResourceLimitExceeded(format!(
                "max_memory_mb {} exceeds local maximum {}",
                limits.max_memory_mb, self.max_memory_mb
            )));
        }
        if limits.timeout_s > self.max_timeout_s {
            return Err(TaskError::ResourceLimitExceeded(format!(
                "timeout_s {} exceeds local maximum {}",
                limits.timeout_s, self.max_timeout_s
            )));
        }
        Ok(())
    }
}

/// Which isolation backend runs tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Interpreter subprocess on the host.
    Process,
    /// One docker container per task.
    Container,
}

/// Container backend options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerOptions {
    /// Docker CLI binary.
    pub docker_path: String,
    pub image: String,
    /// Size of the writable `/tmp` mount (megabytes).
    pub tmpfs_mb: u64,
    pub pids_limit: u32,
    /// User the task runs as inside the container.
    pub user: String,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            docker_path: "docker".to_string(),
            image: "python:3.12-slim".to_string(),
            tmpfs_mb: 100,
            pids_limit: 64,
            user: "nobody".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    pub backend: BackendKind,

    /// Interpreter name → command line that reads the program from stdin.
    pub interpreters: BTreeMap<String, String>,

    pub container: ContainerOptions,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        let interpreters = [
            ("python", "python3 -u -"),
            ("sh", "sh -s"),
            ("bash", "bash -s"),
            ("node", "node -"),
        ]
        .into_iter()
        .map(|(name, command)| (name.to_string(), command.to_string()))
        .collect();

        Self {
            backend: BackendKind::Process,
            interpreters,
            container: ContainerOptions::default(),
        }
    }
}

/// A named program installed on this worker.
///
/// `{{param}}` placeholders in `source` are replaced by the submitted
/// template parameters, falling back to `defaults`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub interpreter: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub defaults: BTreeMap<String, String>,
}

/// Presence beacon settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    pub enabled: bool,
    /// Destination of the broadcast datagrams.
    pub target: String,
    pub interval_secs: u64,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target: format!("255.255.255.255:{}", DEFAULT_DISCOVERY_PORT),
            interval_secs: 3,
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Master address (`host:port`).
    pub master_addr: String,

    /// Name the master certificate is verified against.
    pub server_name: String,

    pub worker_id: WorkerId,

    /// Hostname reported at registration; the machine's when `None`.
    pub hostname: Option<String>,

    /// Address reported at registration.
    pub advertise_addr: String,

    pub capacity: WorkerCapacity,

    pub policy: LocalPolicy,

    pub isolation: IsolationConfig,

    pub templates: BTreeMap<String, TemplateConfig>,

    /// Offer the built-in templates next to `templates`.
    pub builtin_templates: bool,

    /// Attach host usage samples to heartbeats.
    pub report_usage: bool,

    /// Heartbeat interval (seconds).
    pub heartbeat_interval_secs: u64,

    /// Silent intervals before the master is considered lost.
    pub missed_heartbeats: u32,

    /// Connect attempts per round and the backoff between them.
    pub connect_retry: RetryPolicy,

    /// Pause between connect rounds after the master is lost (seconds).
    pub reconnect_delay_secs: u64,

    /// Minimum spacing of progress/output updates per task (milliseconds).
    pub update_interval_ms: u64,

    pub beacon: BeaconConfig,

    /// Shared secret for envelope authentication.
    pub secret_path: PathBuf,

    /// Worker certificate, key and CA.
    pub tls: TlsPaths,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            master_addr: "127.0.0.1:9000".to_string(),
            server_name: "winlink-master".to_string(),
            worker_id: WorkerId::generate(),
            hostname: None,
            advertise_addr: String::new(),
            capacity: WorkerCapacity::default(),
            policy: LocalPolicy::default(),
            isolation: IsolationConfig::default(),
            templates: BTreeMap::new(),
            builtin_templates: true,
            report_usage: true,
            heartbeat_interval_secs: 30,
            missed_heartbeats: 3,
            connect_retry: RetryPolicy::default(),
            reconnect_delay_secs: 5,
            update_interval_ms: 500,
            beacon: BeaconConfig::default(),
            secret_path: PathBuf::from("secrets/auth_token.txt"),
            tls: TlsPaths {
                ca_cert_path: PathBuf::from("certs/ca.crt"),
                cert_path: PathBuf::from("certs/worker.crt"),
                key_path: PathBuf::from("certs/worker.key"),
            },
        }
    }
}

impl WorkerConfig {
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
        validate_worker_id_format(self.worker_id.as_str()).map_err(ConfigError::Invalid)?;
        if self.capacity.max_tasks == 0 {
            return Err(ConfigError::Invalid(
                "capacity.max_tasks must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval_secs == 0 || self.missed_heartbeats == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat interval and missed threshold must be positive".to_string(),
            ));
        }
        if self.isolation.interpreters.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one interpreter must be configured".to_string(),
            ));
        }
        self.connect_retry
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("connect_retry: {}", e)))?;
        for (name, template) in &self.templates {
            if !self.isolation.interpreters.contains_key(&template.interpreter) {
                return Err(ConfigError::Invalid(format!(
                    "template '{}' uses unknown interpreter '{}'",
                    name, template.interpreter
                )));
            }
        }
        Ok(())
    }

    /// Templates this worker can expand.
    ///
    /// Configured templates replace built-ins of the same name; built-ins
    /// whose interpreter is not configured are left out.
    pub fn template_table(&self) -> BTreeMap<String, TemplateConfig> {
        let mut table: BTreeMap<String, TemplateConfig> = if self.builtin_templates {
            templates::builtin()
                .into_iter()
                .filter(|(_, t)| self.isolation.interpreters.contains_key(&t.interpreter))
                .collect()
        } else {
            BTreeMap::new()
        };
        table.extend(self.templates.clone());
        table
    }

    /// Hostname to report, falling back to `$HOSTNAME`.
    pub fn hostname(&self) -> String {
        self.hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Silence after which the master is treated as lost.
    pub fn master_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.missed_heartbeats
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn beacon_interval(&self) -> Duration {
        Duration::from_secs(self.beacon.interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.master_timeout(), Duration::from_secs(90));
        assert_eq!(config.beacon.interval_secs, 3);
        assert!(config.beacon.target.ends_with(":5000"));
    }

    #[test]
    fn test_policy_rejects_oversized_limits() {
        let policy = LocalPolicy {
            max_cpu: 50,
            max_memory_mb: 256,
            max_timeout_s: 60,
        };
        assert!(policy.check(&ResourceLimits::new(50, 256, 60)).is_ok());

        let err = policy.check(&ResourceLimits::new(10, 4096, 10)).unwrap_err();
        assert!(matches!(err, TaskError::ResourceLimitExceeded(_)));
        assert!(err.to_string().starts_with("ResourceLimitExceeded"));

        assert!(policy.check(&ResourceLimits::new(80, 128, 10)).is_err());
        assert!(policy.check(&ResourceLimits::new(10, 128, 120)).is_err());
    }

    #[test]
    fn test_partial_json_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(
            &path,
            r#"{"worker_id":"build-01","master_addr":"10.0.0.5:9001",
                "isolation":{"backend":"container"},
                "templates":{"hello":{"interpreter":"sh","source":"echo {{who}}"}}}"#,
        )
        .unwrap();

        let config = WorkerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.worker_id, WorkerId::new("build-01"));
        assert_eq!(config.master_addr, "10.0.0.5:9001");
        assert_eq!(config.isolation.backend, BackendKind::Container);
        assert!(config.isolation.interpreters.contains_key("python"));
        assert_eq!(config.templates["hello"].source, "echo {{who}}");
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_invalid_worker_id_rejected() {
        let config = WorkerConfig {
            worker_id: WorkerId::new("bad id!"),
            ..WorkerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_negative_jitter_rejected() {
        let mut config = WorkerConfig::default();
        config.connect_retry.jitter_factor = -0.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_template_with_unknown_interpreter_rejected() {
        let mut config = WorkerConfig::default();
        config.templates.insert(
            "report".to_string(),
            TemplateConfig {
                interpreter: "ruby".to_string(),
                source: "puts 1".to_string(),
                defaults: BTreeMap::new(),
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_template_table_merges_builtins() {
        let mut config = WorkerConfig::default();
        let table = config.template_table();
        assert!(table.contains_key("fibonacci"));
        assert_eq!(table["fibonacci"].defaults["n"], "10");

        config.templates.insert(
            "fibonacci".to_string(),
            TemplateConfig {
                interpreter: "sh".to_string(),
                source: "echo fib {{n}}".to_string(),
                defaults: BTreeMap::new(),
            },
        );
        assert_eq!(config.template_table()["fibonacci"].interpreter, "sh");

        config.builtin_templates = false;
        assert_eq!(config.template_table().len(), 1);
    }

    #[test]
    fn test_builtins_need_their_interpreter() {
        let mut config = WorkerConfig::default();
        config.isolation.interpreters.remove("python");
        assert!(config.template_table().is_empty());
    }
}
