//! # Last-known status per worker.
//!
//! Updated by the forwarding task of every worker, read when listing workers.
//!
//! ## Rules
//! - Every status overwrites the previous one for that worker.
//! - `DONE` removes the entry: a worker that is gone has no status.

use std::collections::HashMap;

use tokio::sync::{RwLock, RwLockReadGuard};

use crate::workers::Status;

/// Thread-safe map of worker ID → last status.
#[derive(Debug, Default)]
pub(crate) struct StatusCache {
    state: RwLock<HashMap<String, Status>>,
}

impl StatusCache {
    /// Creates a new empty cache.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records `status` for `id`, dropping the entry on `DONE`.
    pub(crate) async fn update(&self, id: &str, status: Status) {
        let mut state = self.state.write().await;
        if status == Status::Done {
            state.remove(id);
        } else {
            state.insert(id.to_string(), status);
        }
    }

    /// Read access for building consistent snapshots.
    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Status>> {
        self.state.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_done_removes_entry() {
        let cache = StatusCache::new();
        cache.update("p1", Status::Starting).await;
        cache.update("p1", Status::Running).await;
        assert_eq!(cache.read().await.get("p1"), Some(&Status::Running));

        cache.update("p1", Status::Done).await;
        assert!(cache.read().await.get("p1").is_none());
    }
}
