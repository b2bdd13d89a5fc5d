//! Runtime core: reconciliation and lifecycle.
//!
//! The only entry point from this module is [`Supervisor`], which converges
//! running workers to a desired state and drains them on shutdown.
//!
//! Internal modules:
//! - [`supervisor`]: owns the running workers, ports and outlet;
//! - [`reconcile`]: splits a desired state into stop/restart/start sets;
//! - [`forwarder`]: republishes worker changes to the outlet;
//! - [`statuses`]: last-known status per worker;
//! - [`config`]: supervisor configuration (TOML);
//! - [`shutdown`]: cross-platform termination signals.

mod builder;
mod config;
mod forwarder;
mod reconcile;
mod shutdown;
mod statuses;
mod supervisor;

pub use builder::SupervisorBuilder;
pub use config::{PortsConfig, SupervisorConfig};
pub use forwarder::{CollectRequest, Outlet, StatusChanged};
pub use reconcile::{DesiredState, ReconcileReport};
pub use shutdown::wait_for_shutdown_signal;
pub use supervisor::{Supervisor, WorkerInfo, WorkerFamily};
