//! Built-in worker that does nothing but walk the lifecycle.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::workers::builtin::BuiltinContext;
use crate::workers::{Change, Status, Worker, emit};

const DEFAULT_DELAY: Duration = Duration::from_millis(100);

/// `STARTING`, `RUNNING` after a short delay, then `STOPPING`, `DONE` on cancel.
///
/// Useful for testing the supervisor and as a placeholder kind. The delay can
/// be set with the `delay` option (`"250ms"`).
#[derive(Clone, Debug)]
pub struct Noop {
    delay: Duration,
}

impl Noop {
    /// Kind tag under which the default registry provides it.
    pub const KIND: &'static str = "noop";

    /// Creates a noop worker switching states after `delay`.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub(super) fn from_context(ctx: &BuiltinContext) -> Self {
        let delay = match ctx.params.options.get("delay") {
            None => DEFAULT_DELAY,
            Some(raw) => humantime::parse_duration(raw).unwrap_or_else(|e| {
                tracing::warn!(worker_id = %ctx.id, error = %e, "invalid delay option, using default");
                DEFAULT_DELAY
            }),
        };
        Self::new(delay)
    }
}

#[async_trait]
impl Worker for Noop {
    async fn run(self: Box<Self>, ctx: CancellationToken, changes: mpsc::Sender<Change>) {
        emit(&changes, Status::Starting).await;
        tokio::time::sleep(self.delay).await;
        emit(&changes, Status::Running).await;

        ctx.cancelled().await;

        emit(&changes, Status::Stopping).await;
        tokio::time::sleep(self.delay).await;
        emit(&changes, Status::Done).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_lifecycle() {
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(10);
        let run = tokio::spawn(Box::new(Noop::new(Duration::from_millis(10))).run(token.clone(), tx));

        assert_eq!(rx.recv().await, Some(Change::status(Status::Starting)));
        assert_eq!(rx.recv().await, Some(Change::status(Status::Running)));
        token.cancel();
        assert_eq!(rx.recv().await, Some(Change::status(Status::Stopping)));
        assert_eq!(rx.recv().await, Some(Change::status(Status::Done)));
        assert_eq!(rx.recv().await, None);
        run.await.unwrap();
    }
}
