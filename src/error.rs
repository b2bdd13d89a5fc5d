//! Error types used by the agentvisor runtime and its workers.
//!
//! - [`SupervisorError`]: errors raised by reconciliation itself.
//! - [`ProcessError`]: why a process worker could not be initialized.
//! - [`PortError`]: listen port arbitration failures.
//! - [`RenderError`]: template rendering failures.
//! - [`CollectError`]: a built-in collector failed one collection.
//! - [`ConfigError`]: configuration could not be loaded.
//! - [`VersionError`]: an exporter's version could not be determined.
//!
//! Every enum provides `as_label()`, a short stable snake_case label for logs.

use std::path::PathBuf;

use thiserror::Error;

/// # Errors produced by the supervisor.
///
/// `ShuttingDown` rejects a whole `set_state` call; every other variant is
/// reported for a single worker and never aborts the rest of the batch.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The root token was cancelled; the call is rejected without any processing.
    #[error("supervisor is shutting down")]
    ShuttingDown,

    /// No built-in constructor is registered for this kind.
    #[error("unhandled worker kind {kind:?}")]
    UnknownKind {
        /// The requested kind tag.
        kind: String,
    },

    /// No executable is configured for this process kind.
    #[error("no exec path for worker kind {kind:?}")]
    NoExecPath {
        /// The requested kind tag.
        kind: String,
    },

    /// Port reservation failed.
    #[error(transparent)]
    Port(#[from] PortError),

    /// Template rendering failed.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// The process could not be initialized.
    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl SupervisorError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use agentvisor::{PortError, SupervisorError};
    ///
    /// let err = SupervisorError::from(PortError::NoFreePort);
    /// assert_eq!(err.as_label(), "port_no_free_port");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorError::ShuttingDown => "supervisor_shutting_down",
            SupervisorError::UnknownKind { .. } => "supervisor_unknown_kind",
            SupervisorError::NoExecPath { .. } => "supervisor_no_exec_path",
            SupervisorError::Port(e) => e.as_label(),
            SupervisorError::Render(e) => e.as_label(),
            SupervisorError::Process(e) => e.as_label(),
        }
    }

    /// Indicates whether starting again with a fresh port may help.
    ///
    /// Only initialization failures qualify: the previous port may have been
    /// grabbed by someone else between reservation and bind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SupervisorError::Process(_))
    }
}

/// # Process initialization failures.
///
/// Launch failures and early exits are classified the same way: the worker
/// cannot currently run and reaches `INITIALIZATION_ERROR`.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The binary could not be launched (missing, permission denied, ...).
    #[error("failed to start {path:?}: {reason}")]
    Spawn {
        /// Executable path.
        path: PathBuf,
        /// OS error message.
        reason: String,
    },

    /// The process exited before the grace window elapsed.
    #[error("process exited early: {status}")]
    ExitedEarly {
        /// Exit status as reported by the OS.
        status: String,
    },

    /// The OS did not report a pid for the freshly spawned child.
    #[error("failed to get process ID")]
    MissingPid,
}

impl ProcessError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ProcessError::Spawn { .. } => "process_spawn_failed",
            ProcessError::ExitedEarly { .. } => "process_exited_early",
            ProcessError::MissingPid => "process_missing_pid",
        }
    }
}

/// # Port registry failures.
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    /// Every port in the range is reserved or bound by someone else.
    #[error("no free port")]
    NoFreePort,

    /// The port was never reserved through this registry.
    #[error("port {0} not reserved")]
    NotReserved(u16),

    /// Something still listens on the port.
    #[error("port {0} is busy")]
    Busy(u16),
}

impl PortError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            PortError::NoFreePort => "port_no_free_port",
            PortError::NotReserved(_) => "port_not_reserved",
            PortError::Busy(_) => "port_busy",
        }
    }
}

/// # Template rendering failures.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RenderError {
    /// A placeholder names a variable that does not exist.
    #[error("{template}: unknown template key {key:?}")]
    UnknownKey {
        /// Which template was being rendered (`args`, `env`, `dsn`, a file name).
        template: String,
        /// The unresolved key.
        key: String,
    },

    /// A left delimiter without a matching right delimiter.
    #[error("{template}: unterminated placeholder at byte {offset}")]
    Unterminated {
        /// Which template was being rendered.
        template: String,
        /// Byte offset of the opening delimiter.
        offset: usize,
    },

    /// Writing a rendered text file failed.
    #[error("failed to write {path:?}: {source}")]
    Io {
        /// Target file or directory.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl RenderError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RenderError::UnknownKey { .. } => "render_unknown_key",
            RenderError::Unterminated { .. } => "render_unterminated",
            RenderError::Io { .. } => "render_io",
        }
    }
}

/// # One failed collection of a built-in collector.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CollectError {
    /// Collection failed but may succeed if retried.
    #[error("collection failed: {error}")]
    Fail {
        /// The underlying error message.
        error: String,
    },
}

impl CollectError {
    /// Shorthand for [`CollectError::Fail`].
    pub fn fail(error: impl Into<String>) -> Self {
        CollectError::Fail {
            error: error.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            CollectError::Fail { .. } => "collect_failed",
        }
    }
}

/// # Configuration loading failures.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path:?}: {source}")]
    Read {
        /// Config file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for the expected shape.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "config_read",
            ConfigError::Parse(_) => "config_parse",
        }
    }
}

/// # Exporter version discovery failures.
///
/// Never fatal: the worker is started without a version.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum VersionError {
    /// A configured version pattern is not a valid regex.
    #[error("invalid version pattern for {kind}: {source}")]
    Pattern {
        /// Process kind the pattern belongs to.
        kind: String,
        /// Regex compilation error.
        #[source]
        source: regex::Error,
    },

    /// The binary could not be run.
    #[error("failed to run {path:?}: {reason}")]
    Run {
        /// Executable.
        path: PathBuf,
        /// OS error text.
        reason: String,
    },

    /// The binary did not exit in time.
    #[error("{path:?} did not report its version in time")]
    Timeout {
        /// Executable.
        path: PathBuf,
    },

    /// The binary exited unsuccessfully.
    #[error("{path:?} exited with {status}")]
    Exit {
        /// Executable.
        path: PathBuf,
        /// Exit status text.
        status: String,
    },

    /// The output did not match the pattern.
    #[error("no version found in output of {path:?}")]
    NoMatch {
        /// Executable.
        path: PathBuf,
    },
}

impl VersionError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            VersionError::Pattern { .. } => "version_pattern",
            VersionError::Run { .. } => "version_run",
            VersionError::Timeout { .. } => "version_timeout",
            VersionError::Exit { .. } => "version_exit",
            VersionError::NoMatch { .. } => "version_no_match",
        }
    }
}
