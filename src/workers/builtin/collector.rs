//! # Closure-backed collector (`CollectorFn`)
//!
//! [`CollectorFn`] wraps a closure `F: Fn(CancellationToken) -> Fut` that
//! performs **one** collection and returns the samples. The worker calls it
//! every `interval`, publishes the samples as metrics changes and paces
//! retries with a [`Backoff`] when a collection fails.
//!
//! ```text
//! STARTING ──collect ok──► RUNNING (+metrics) ──collect ok──► (+metrics) …
//!    ▲                        │
//!    │                        └──collect err──► WAITING ──backoff──► STARTING
//!    └─────────────collect err─────────────────┘
//! cancel: RUNNING ──► STOPPING ──► DONE;  WAITING ──► DONE
//! ```
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use agentvisor::{BackoffPolicy, BuiltinRegistry, CollectError, CollectorFn, MetricsBucket, Worker};
//!
//! let registry = BuiltinRegistry::default().register("uptime", |ctx| {
//!     let worker = CollectorFn::new(Duration::from_secs(10), ctx.backoff, |_ctx: CancellationToken| async {
//!         Ok::<_, CollectError>(vec![MetricsBucket {
//!             metric: "up".into(),
//!             labels: Default::default(),
//!             value: 1.0,
//!         }])
//!     });
//!     Ok(Box::new(worker) as Box<dyn Worker>)
//! });
//! assert_eq!(registry.kinds(), vec!["noop", "uptime"]);
//! ```

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::CollectError;
use crate::policies::{Backoff, BackoffPolicy};
use crate::workers::{Change, MetricsBucket, Status, Worker, emit};

/// Function-backed built-in worker.
pub struct CollectorFn<F> {
    f: F,
    interval: Duration,
    backoff: Backoff,
}

impl<F> CollectorFn<F> {
    /// Creates a collector calling `f` every `interval`.
    pub fn new(interval: Duration, backoff: BackoffPolicy, f: F) -> Self {
        Self {
            f,
            interval,
            backoff: Backoff::with_policy(backoff),
        }
    }
}

#[async_trait]
impl<F, Fut> Worker for CollectorFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<MetricsBucket>, CollectError>> + Send + 'static,
{
    async fn run(self: Box<Self>, ctx: CancellationToken, changes: mpsc::Sender<Change>) {
        let mut this = *self;
        let mut running = false;
        emit(&changes, Status::Starting).await;

        loop {
            match (this.f)(ctx.child_token()).await {
                Ok(buckets) => {
                    let change = if running {
                        Change::metrics(buckets)
                    } else {
                        running = true;
                        this.backoff.reset();
                        Change {
                            status: Some(Status::Running),
                            metrics: Some(buckets),
                        }
                    };
                    let _ = changes.send(change).await;

                    tokio::select! {
                        _ = ctx.cancelled() => break,
                        _ = tokio::time::sleep(this.interval) => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, label = e.as_label(), "collection failed");
                    running = false;
                    emit(&changes, Status::Waiting).await;

                    tokio::select! {
                        _ = ctx.cancelled() => {
                            emit(&changes, Status::Done).await;
                            return;
                        }
                        _ = tokio::time::sleep(this.backoff.delay()) => {}
                    }
                    emit(&changes, Status::Starting).await;
                }
            }
        }

        emit(&changes, Status::Stopping).await;
        emit(&changes, Status::Done).await;
    }
}
