//! # Republishing worker changes upward.
//!
//! One forwarding task per worker drains its private change channel:
//! ```text
//! worker ──Change──► forward() ──► StatusCache::update(id, status)
//!                        ├──────► Outlet.changes  (StatusChanged{id, status, port, exec_path, version})
//!                        └──────► Outlet.metrics  (CollectRequest{id, buckets})
//! ```
//! The task ends when the worker's channel closes; its `JoinHandle` is the
//! worker's completion signal. If the channel closes without `DONE` (the
//! worker panicked), a `DONE` is published on its behalf.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::statuses::StatusCache;
use crate::workers::{Change, MetricsBucket, Status};

/// A worker changed status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusChanged {
    /// Worker ID.
    pub worker_id: String,
    /// New status.
    pub status: Status,
    /// Listen port (process workers only).
    pub listen_port: Option<u16>,
    /// Executable (process workers only).
    pub exec_path: Option<PathBuf>,
    /// Executable version, if its kind has a version pattern and `--version` matched.
    pub version: Option<String>,
}

/// A built-in worker collected metrics.
#[derive(Clone, Debug, PartialEq)]
pub struct CollectRequest {
    /// Worker ID.
    pub worker_id: String,
    /// Collected samples.
    pub buckets: Vec<MetricsBucket>,
}

/// Receiving ends of the two outward channels.
///
/// Both close after the supervisor has stopped every worker on shutdown.
#[derive(Debug)]
pub struct Outlet {
    /// Every status transition of every worker.
    pub changes: mpsc::Receiver<StatusChanged>,
    /// Every metrics payload of every built-in worker.
    pub metrics: mpsc::Receiver<CollectRequest>,
}

/// Sending ends of the outward channels.
#[derive(Clone, Debug)]
pub(crate) struct Senders {
    pub(crate) changes: mpsc::Sender<StatusChanged>,
    pub(crate) metrics: mpsc::Sender<CollectRequest>,
}

impl Senders {
    /// Creates both channels with the same capacity.
    pub(crate) fn channel(capacity: usize) -> (Self, Outlet) {
        let (changes_tx, changes_rx) = mpsc::channel(capacity);
        let (metrics_tx, metrics_rx) = mpsc::channel(capacity);
        (
            Self {
                changes: changes_tx,
                metrics: metrics_tx,
            },
            Outlet {
                changes: changes_rx,
                metrics: metrics_rx,
            },
        )
    }
}

/// Identity attached to every republished change.
#[derive(Clone, Debug)]
pub(crate) struct Origin {
    pub(crate) worker_id: String,
    pub(crate) listen_port: Option<u16>,
    pub(crate) exec_path: Option<PathBuf>,
    pub(crate) version: Option<String>,
}

/// Drains `rx` until it closes. Runs inside the worker's span.
pub(crate) async fn forward(
    mut rx: mpsc::Receiver<Change>,
    origin: Origin,
    statuses: Arc<StatusCache>,
    outlet: Senders,
) {
    let mut last = None;
    while let Some(change) = rx.recv().await {
        if let Some(status) = change.status {
            last = Some(status);
            publish(&origin, status, &statuses, &outlet).await;
        }
        if let Some(buckets) = change.metrics {
            let req = CollectRequest {
                worker_id: origin.worker_id.clone(),
                buckets,
            };
            let _ = outlet.metrics.send(req).await;
        }
    }

    if last != Some(Status::Done) {
        warn!(last = ?last, "worker stopped without reporting DONE");
        publish(&origin, Status::Done, &statuses, &outlet).await;
    }
}

async fn publish(origin: &Origin, status: Status, statuses: &StatusCache, outlet: &Senders) {
    statuses.update(&origin.worker_id, status).await;
    debug!(%status, "sending status");
    let ev = StatusChanged {
        worker_id: origin.worker_id.clone(),
        status,
        listen_port: origin.listen_port,
        exec_path: origin.exec_path.clone(),
        version: origin.version.clone(),
    };
    let _ = outlet.changes.send(ev).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Origin {
        Origin {
            worker_id: "p1".into(),
            listen_port: Some(65000),
            exec_path: None,
            version: Some("1.8.2".into()),
        }
    }

    #[tokio::test]
    async fn test_synthesizes_done_when_channel_closes_early() {
        let statuses = Arc::new(StatusCache::new());
        let (senders, mut outlet) = Senders::channel(10);
        let (tx, rx) = mpsc::channel(10);

        tx.send(Change::status(Status::Starting)).await.unwrap();
        drop(tx);
        forward(rx, origin(), Arc::clone(&statuses), senders).await;

        let first = outlet.changes.recv().await.unwrap();
        assert_eq!(first.status, Status::Starting);
        assert_eq!(first.listen_port, Some(65000));
        assert_eq!(first.version.as_deref(), Some("1.8.2"));
        assert_eq!(outlet.changes.recv().await.unwrap().status, Status::Done);
        assert!(outlet.changes.recv().await.is_none());
        assert!(statuses.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_go_to_their_own_channel() {
        let statuses = Arc::new(StatusCache::new());
        let (senders, mut outlet) = Senders::channel(10);
        let (tx, rx) = mpsc::channel(10);

        let bucket = MetricsBucket {
            metric: "up".into(),
            labels: Default::default(),
            value: 1.0,
        };
        tx.send(Change {
            status: Some(Status::Running),
            metrics: Some(vec![bucket.clone()]),
        })
        .await
        .unwrap();
        tx.send(Change::status(Status::Done)).await.unwrap();
        drop(tx);
        forward(rx, origin(), statuses, senders).await;

        let req = outlet.metrics.recv().await.unwrap();
        assert_eq!(req.worker_id, "p1");
        assert_eq!(req.buckets, vec![bucket]);
        assert_eq!(outlet.changes.recv().await.unwrap().status, Status::Running);
        assert_eq!(outlet.changes.recv().await.unwrap().status, Status::Done);
        assert!(outlet.changes.recv().await.is_none());
    }
}
