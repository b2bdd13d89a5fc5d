//! # Desired-state diffing.
//!
//! For one worker family (processes or built-ins) [`diff`] splits IDs into
//! three disjoint, sorted sets:
//!
//! ```text
//!   running ∖ desired                    ──► to_stop
//!   running ∩ desired, params differ     ──► to_restart
//!   desired ∖ running                    ──► to_start
//!   running ∩ desired, params equal      ──► untouched
//! ```
//!
//! Params are compared as requested, before any rendering.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::SupervisorError;
use crate::workers::{BuiltinParams, ProcessParams};

/// What the supervisor should be running.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DesiredState {
    /// Process workers by ID.
    pub processes: HashMap<String, ProcessParams>,
    /// Built-in workers by ID.
    pub builtins: HashMap<String, BuiltinParams>,
}

/// Outcome of one `set_state` (or `restart_all`) call.
///
/// Per-worker failures never abort the batch; they are collected in `failed`.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// IDs started fresh.
    pub started: Vec<String>,
    /// IDs stopped and started again with new params.
    pub restarted: Vec<String>,
    /// IDs stopped for good.
    pub stopped: Vec<String>,
    /// IDs that could not be (re)started, with the reason.
    pub failed: Vec<(String, SupervisorError)>,
}

impl ReconcileReport {
    /// `true` if no worker failed.
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// ID sets computed for one worker family.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Plan {
    pub(crate) to_start: Vec<String>,
    pub(crate) to_restart: Vec<String>,
    pub(crate) to_stop: Vec<String>,
}

/// Diffs `current` against `desired`; `params` extracts what a running entry was started with.
pub(crate) fn diff<R, P: PartialEq>(
    current: &HashMap<String, R>,
    desired: &HashMap<String, P>,
    params: impl Fn(&R) -> &P,
) -> Plan {
    let mut plan = Plan::default();

    for (id, running) in current {
        match desired.get(id) {
            None => plan.to_stop.push(id.clone()),
            Some(want) if params(running) != want => plan.to_restart.push(id.clone()),
            Some(_) => {}
        }
    }
    plan.to_start = desired
        .keys()
        .filter(|id| !current.contains_key(*id))
        .cloned()
        .collect();

    plan.to_start.sort_unstable();
    plan.to_restart.sort_unstable();
    plan.to_stop.sort_unstable();
    plan
}
