//! # Workers: units the supervisor keeps running.
//!
//! Two families share one contract ([`Worker`]):
//! - [`process`]: an external exporter binary wrapped in a restart state machine;
//! - [`builtin`]: an in-process routine (metric collector) constructed by kind tag.
//!
//! ## Contract
//! ```text
//! Supervisor ──► worker.run(token, changes_tx) ──► Change { status?, metrics? } …
//!                                                    │
//!                                                    └─► last change carries Status::Done,
//!                                                        then `changes_tx` is dropped (channel closes)
//! ```
//!
//! - `run` is called exactly once and returns only after `DONE` was sent.
//! - A status is sent **before** the side effects of its transition run.
//! - Cancelling the token is the only way to ask a worker to stop.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod builtin;
pub mod process;

pub use builtin::{BuiltinContext, BuiltinParams, BuiltinRegistry, CollectorFn, Noop};
pub use process::{ProcessHandle, ProcessParams, ProcessWorker};

/// Capacity of each worker's private change channel.
pub const CHANGES_CAPACITY: usize = 10;

/// Lifecycle state of a worker.
///
/// ```text
/// STARTING ──► RUNNING ──► WAITING ──► STARTING …
///    │            │           │
///    │            ▼           ▼
///    │         STOPPING ──► DONE ◄── INITIALIZATION_ERROR ◄── STARTING
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// Being launched; not yet known to be healthy.
    Starting,
    /// Survived the grace window (process) or produced data (built-in).
    Running,
    /// Crashed after running; waiting for the backoff delay before restarting.
    Waiting,
    /// Asked to stop; shutting down.
    Stopping,
    /// Terminal. Nothing else is sent after it.
    Done,
    /// Could not be launched or died within the grace window. Followed by `Done`.
    InitializationError,
}

impl Status {
    /// Returns the wire name, e.g. `"INITIALIZATION_ERROR"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Starting => "STARTING",
            Status::Running => "RUNNING",
            Status::Waiting => "WAITING",
            Status::Stopping => "STOPPING",
            Status::Done => "DONE",
            Status::InitializationError => "INITIALIZATION_ERROR",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One collected sample.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct MetricsBucket {
    /// Metric name.
    pub metric: String,
    /// Label set.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Sample value.
    pub value: f64,
}

/// Notification sent by a worker: a status transition, a metrics payload, or both.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Change {
    /// New status, if the worker transitioned.
    pub status: Option<Status>,
    /// Collected metrics, if any.
    pub metrics: Option<Vec<MetricsBucket>>,
}

impl Change {
    /// A pure status transition.
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            metrics: None,
        }
    }

    /// A pure metrics payload.
    pub fn metrics(buckets: Vec<MetricsBucket>) -> Self {
        Self {
            status: None,
            metrics: Some(buckets),
        }
    }
}

/// # Shared lifecycle contract of process and built-in workers.
///
/// Implementations report every transition on `changes`, finish with
/// [`Status::Done`] and return; dropping `changes` closes the channel.
///
/// # Example
/// ```rust
/// use async_trait::async_trait;
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
/// use agentvisor::{Change, Status, Worker};
///
/// struct Idle;
///
/// #[async_trait]
/// impl Worker for Idle {
///     async fn run(self: Box<Self>, ctx: CancellationToken, changes: mpsc::Sender<Change>) {
///         let _ = changes.send(Change::status(Status::Starting)).await;
///         let _ = changes.send(Change::status(Status::Running)).await;
///         ctx.cancelled().await;
///         let _ = changes.send(Change::status(Status::Stopping)).await;
///         let _ = changes.send(Change::status(Status::Done)).await;
///     }
/// }
/// ```
#[async_trait]
pub trait Worker: Send + 'static {
    /// Runs until `ctx` is cancelled (or initialization fails) and `DONE` is sent.
    async fn run(self: Box<Self>, ctx: CancellationToken, changes: mpsc::Sender<Change>);
}

/// Sends a status change, ignoring a closed receiver.
pub(crate) async fn emit(changes: &mpsc::Sender<Change>, status: Status) {
    let _ = changes.send(Change::status(status)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names() {
        assert_eq!(Status::InitializationError.to_string(), "INITIALIZATION_ERROR");
        assert_eq!(Status::Starting.as_str(), "STARTING");
    }
}
