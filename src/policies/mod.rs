//! Restart pacing.
//!
//! This module groups the knobs that control **how long** a worker waits
//! before it is started again after a crash.
//!
//! ## Contents
//! - [`BackoffPolicy`] floor / ceiling / growth factor + jitter
//! - [`Backoff`]       stateful generator, one per worker
//! - [`JitterPolicy`]  randomization strategy to avoid thundering herd
//!
//! ## Quick wiring
//! ```text
//! SupervisorConfig { backoff: BackoffPolicy, .. }
//!      └─► ProcessWorker / CollectorFn own a Backoff::with_policy(policy):
//!           - delay() on every RUNNING → WAITING transition
//!           - reset() on every STARTING → RUNNING transition
//! ```
//!
//! ## Defaults
//! - `BackoffPolicy::default()` → min=1s, max=30s, factor=2.0, jitter=Decorrelated.

mod backoff;
mod jitter;

pub use backoff::{Backoff, BackoffPolicy};
pub use jitter::JitterPolicy;
