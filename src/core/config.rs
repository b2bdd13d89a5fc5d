//! # Global runtime configuration.
//!
//! Provides [`SupervisorConfig`], centralized settings for the supervisor runtime.
//!
//! Config is used in two ways:
//! 1. **Supervisor creation**: `Supervisor::builder(config).build()`
//! 2. **Worker defaults**: every process worker gets `config.process_settings()`,
//!    every built-in gets `config.backoff`.
//!
//! It can be written by hand or loaded from TOML; durations use humantime
//! strings:
//! ```toml
//! running_after = "1s"
//! kill_after = "5s"
//! log_lines = 100
//!
//! [ports]
//! min = 42000
//! max = 51999
//! reserved = [42100]
//!
//! [backoff]
//! min = "1s"
//! max = "30s"
//!
//! [exec_paths]
//! node_exporter = "/usr/local/agentvisor/exporters/node_exporter"
//! ```
//!
//! ## Sentinel values
//! - `start_attempts = 0` → treated as 1
//! - `channel_capacity = 0` → treated as 1

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, SupervisorError};
use crate::policies::BackoffPolicy;
use crate::workers::process::ProcessSettings;

/// Inclusive listen-port range plus permanently busy ports.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// First port of the range.
    pub min: u16,
    /// Last port of the range (inclusive).
    pub max: u16,
    /// Ports that are never handed out.
    pub reserved: Vec<u16>,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            min: 42000,
            max: 51999,
            reserved: Vec::new(),
        }
    }
}

/// Global configuration for the supervisor runtime.
///
/// Defines:
/// - **Ports**: the range listen ports are taken from
/// - **Process lifecycle**: grace and kill windows, restart backoff
/// - **Start verification**: how long and how often `set_state` tries
/// - **Capture**: log buffer size, redaction switch
/// - **Paths**: executables, working directory, rendered files
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Listen port range.
    pub ports: PortsConfig,

    /// How long a process must stay up after launch to count as `RUNNING`.
    ///
    /// Exiting earlier is an initialization failure.
    #[serde(with = "humantime_serde")]
    pub running_after: Duration,

    /// How long a stopping process gets between SIGTERM and SIGKILL.
    #[serde(with = "humantime_serde")]
    pub kill_after: Duration,

    /// Restart pacing for crashed processes and failing collectors.
    pub backoff: BackoffPolicy,

    /// How long `set_state` waits for a new process's initialization verdict.
    ///
    /// When it expires, the process is kept and considered started.
    #[serde(with = "humantime_serde")]
    pub start_wait: Duration,

    /// Start attempts per process, each with a fresh port.
    pub start_attempts: u32,

    /// Lines kept per worker log buffer.
    pub log_lines: usize,

    /// Capacity of the two outward channels.
    ///
    /// Consumers must keep draining them: a full channel blocks the
    /// forwarding of further changes.
    pub channel_capacity: usize,

    /// Working directory of every child process.
    pub working_dir: PathBuf,

    /// Root for rendered text files (`<temp_dir>/<kind>/<worker_id>/`).
    pub temp_dir: PathBuf,

    /// Value of the `paths_base` template variable.
    pub paths_base: PathBuf,

    /// Process kind → executable.
    pub exec_paths: HashMap<String, PathBuf>,

    /// Process kind → regex extracting the version from `<exec> --version`.
    ///
    /// The first capture group is the version. Kinds without an entry have none.
    pub version_patterns: HashMap<String, String>,

    /// Disables redaction of captured output.
    pub debug: bool,
}

impl SupervisorConfig {
    /// Parses a TOML document; missing fields take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Settings handed to every process worker.
    pub fn process_settings(&self) -> ProcessSettings {
        ProcessSettings {
            running_after: self.running_after,
            kill_after: self.kill_after,
            backoff: self.backoff,
            working_dir: self.working_dir.clone(),
        }
    }

    /// Executable for a process kind.
    pub fn exec_path(&self, kind: &str) -> Result<&Path, SupervisorError> {
        self.exec_paths
            .get(kind)
            .map(PathBuf::as_path)
            .ok_or_else(|| SupervisorError::NoExecPath { kind: kind.into() })
    }

    /// Start attempts clamped to a minimum of 1.
    #[inline]
    pub fn start_attempts_clamped(&self) -> u32 {
        self.start_attempts.max(1)
    }

    /// Channel capacity clamped to a minimum of 1.
    #[inline]
    pub fn channel_capacity_clamped(&self) -> usize {
        self.channel_capacity.max(1)
    }
}

impl Default for SupervisorConfig {
    /// Default configuration:
    ///
    /// - `ports = 42000..=51999`, nothing reserved
    /// - `running_after = 1s`, `kill_after = 5s`
    /// - `backoff = BackoffPolicy::default()` (1s..30s, decorrelated jitter)
    /// - `start_wait = 2s`, `start_attempts = 3`
    /// - `log_lines = 100`, `channel_capacity = 100`
    /// - `working_dir = /`, `temp_dir = <os tmp>/agentvisor`, `paths_base = /usr/local/agentvisor`
    /// - `version_patterns` for the stock exporters (`node_exporter`, `mysqld_exporter`, ...)
    fn default() -> Self {
        Self {
            ports: PortsConfig::default(),
            running_after: Duration::from_secs(1),
            kill_after: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            start_wait: Duration::from_secs(2),
            start_attempts: 3,
            log_lines: 100,
            channel_capacity: 100,
            working_dir: PathBuf::from("/"),
            temp_dir: std::env::temp_dir().join("agentvisor"),
            paths_base: PathBuf::from("/usr/local/agentvisor"),
            exec_paths: HashMap::new(),
            version_patterns: default_version_patterns(),
            debug: false,
        }
    }
}

fn default_version_patterns() -> HashMap<String, String> {
    [
        ("node_exporter", r"node_exporter, version ([!-~]*)"),
        ("mysqld_exporter", r"mysqld_exporter, version ([!-~]*)"),
        ("postgres_exporter", r"postgres_exporter, version ([!-~]*)"),
        ("mongodb_exporter", r"Version: ([!-~]*)"),
        ("proxysql_exporter", r"proxysql_exporter, version ([!-~]*)"),
        ("rds_exporter", r"rds_exporter, version ([!-~]*)"),
        ("azure_exporter", r"azure_metrics_exporter, version ([!-~]*)"),
    ]
    .into_iter()
    .map(|(kind, re)| (kind.to_string(), re.to_string()))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policies::JitterPolicy;

    #[test]
    fn test_empty_document_is_default() {
        let cfg = SupervisorConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.ports, PortsConfig::default());
        assert_eq!(cfg.running_after, Duration::from_secs(1));
        assert_eq!(cfg.start_attempts, 3);
        assert_eq!(cfg.backoff, BackoffPolicy::default());
    }

    #[test]
    fn test_parses_durations_and_tables() {
        let cfg = SupervisorConfig::from_toml_str(
            r#"
            running_after = "250ms"
            kill_after = "1m 30s"
            debug = true

            [ports]
            min = 65000
            max = 65099
            reserved = [65010]

            [backoff]
            min = "100ms"
            jitter = "none"

            [exec_paths]
            node_exporter = "/opt/node_exporter"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.running_after, Duration::from_millis(250));
        assert_eq!(cfg.kill_after, Duration::from_secs(90));
        assert!(cfg.debug);
        assert_eq!(cfg.ports.reserved, vec![65010]);
        assert_eq!(cfg.backoff.min, Duration::from_millis(100));
        assert_eq!(cfg.backoff.max, Duration::from_secs(30));
        assert_eq!(cfg.backoff.jitter, JitterPolicy::None);
        assert_eq!(
            cfg.exec_path("node_exporter").unwrap(),
            Path::new("/opt/node_exporter")
        );
        assert!(matches!(
            cfg.exec_path("mysqld_exporter"),
            Err(SupervisorError::NoExecPath { .. })
        ));
    }

    #[test]
    fn test_version_patterns_default_and_override() {
        let cfg = SupervisorConfig::default();
        assert!(cfg.version_patterns.contains_key("node_exporter"));

        let cfg = SupervisorConfig::from_toml_str(
            r#"
            [version_patterns]
            my_exporter = 'my_exporter v([0-9.]+)'
            "#,
        )
        .unwrap();
        assert_eq!(cfg.version_patterns.len(), 1);
        assert_eq!(cfg.version_patterns["my_exporter"], "my_exporter v([0-9.]+)");
    }

    #[test]
    fn test_invalid_duration_is_parse_error() {
        let err = SupervisorConfig::from_toml_str(r#"kill_after = "soon""#).unwrap_err();
        assert_eq!(err.as_label(), "config_parse");
    }

    #[test]
    fn test_load_missing_file() {
        let err = SupervisorConfig::load("/nonexistent/agentvisor.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_clamped_accessors() {
        let cfg = SupervisorConfig {
            start_attempts: 0,
            channel_capacity: 0,
            ..SupervisorConfig::default()
        };
        assert_eq!(cfg.start_attempts_clamped(), 1);
        assert_eq!(cfg.channel_capacity_clamped(), 1);
    }
}
