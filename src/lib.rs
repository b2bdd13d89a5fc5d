//! # agentvisor
//!
//! **Agentvisor** keeps a host's monitoring workers running: external exporter
//! processes and in-process metric collectors.
//!
//! A control plane hands it a desired state (worker ID → params); the
//! supervisor starts, restarts and stops workers until the running set matches,
//! assigns each process a free listen port, renders its arguments from
//! templates, keeps a redacted tail of its output and reports every status
//! transition and collected metric on two outward channels.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!                   DesiredState { processes, builtins }
//!                                 │ set_state()
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Supervisor                                                       │
//! │  - diff per family (stop → restart → start)                       │
//! │  - PortRegistry (round-robin listen ports)                        │
//! │  - Render (templates: args, env, text files, DSNs)                │
//! │  - BuiltinRegistry (kind tag → constructor)                       │
//! │  - StatusCache (last status per worker)                           │
//! └──────┬──────────────────┬──────────────────┬──────────────────────┘
//!        ▼                  ▼                  ▼
//!  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!  │ProcessWorker │   │ProcessWorker │   │ CollectorFn  │
//!  │(restart FSM) │   │(restart FSM) │   │  (built-in)  │
//!  └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!         │ Change           │ Change           │ Change{status?, metrics?}
//!         ▼                  ▼                  ▼
//!     forward()          forward()          forward()      (one task per worker)
//!         └──────────────────┼──────────────────┘
//!                            ▼
//!        Outlet { changes: StatusChanged, metrics: CollectRequest }
//! ```
//!
//! ### Process lifecycle
//! ```text
//! STARTING ──► spawn ──► alive after running_after? ──► RUNNING
//!    │                          │ no                       │ exited
//!    │ (never ran)              ▼                          ▼
//!    └────────────► INITIALIZATION_ERROR ──► DONE       WAITING ── backoff ──► STARTING
//!
//! cancel ──► STOPPING ──► SIGTERM ──► kill_after ──► SIGKILL ──► DONE
//! ```
//!
//! ## Features
//! | Area              | Description                                                  | Key types / traits                          |
//! |-------------------|--------------------------------------------------------------|---------------------------------------------|
//! | **Supervision**   | Converge to a desired state, restart all, list, shut down.   | [`Supervisor`], [`DesiredState`]            |
//! | **Workers**       | One contract for processes and built-ins.                    | [`Worker`], [`ProcessWorker`], [`CollectorFn`] |
//! | **Ports**         | Round-robin listen port allocation with a bind probe.        | [`PortRegistry`]                            |
//! | **Templates**     | `{{ .listen_port }}`-style args, env, files and DSNs.        | [`Render`], [`TemplateRenderer`]            |
//! | **Logs**          | Bounded, redacted output ring per worker.                    | [`LogBuffer`]                               |
//! | **Versions**      | `--version` of each exporter, matched per kind.              | [`VersionProbe`]                            |
//! | **Policies**      | Restart backoff with jitter.                                 | [`BackoffPolicy`], [`JitterPolicy`]         |
//! | **Errors**        | Typed errors with stable labels.                             | [`SupervisorError`], [`ProcessError`]       |
//! | **Configuration** | TOML supervisor settings.                                    | [`SupervisorConfig`]                        |
//!
//! ## Example
//! ```rust,no_run
//! use std::collections::HashMap;
//! use agentvisor::{BuiltinParams, DesiredState, Supervisor, SupervisorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (sup, mut outlet) = Supervisor::builder(SupervisorConfig::default()).build();
//!
//!     tokio::spawn(async move {
//!         while let Some(ev) = outlet.changes.recv().await {
//!             println!("{}: {}", ev.worker_id, ev.status);
//!         }
//!     });
//!
//!     let desired = DesiredState {
//!         builtins: HashMap::from([(
//!             "noop-1".to_string(),
//!             BuiltinParams { kind: "noop".into(), ..BuiltinParams::default() },
//!         )]),
//!         ..DesiredState::default()
//!     };
//!     sup.set_state(desired).await?;
//!
//!     agentvisor::wait_for_shutdown_signal().await?;
//!     sup.shutdown();
//!     sup.wait_stopped().await;
//!     Ok(())
//! }
//! ```
mod core;
mod error;
mod logs;
mod policies;
mod ports;
mod template;
mod version;
mod workers;

// ---- Public re-exports ----

pub use core::{
    CollectRequest, DesiredState, Outlet, PortsConfig, ReconcileReport, StatusChanged, Supervisor,
    SupervisorBuilder, SupervisorConfig, WorkerInfo, WorkerFamily, wait_for_shutdown_signal,
};
pub use error::{
    CollectError, ConfigError, PortError, ProcessError, RenderError, SupervisorError, VersionError,
};
pub use logs::{LogBuffer, MAX_PENDING, REDACTED};
pub use policies::{Backoff, BackoffPolicy, JitterPolicy};
pub use ports::PortRegistry;
pub use template::{Delims, Invocation, Render, Template, TemplateRenderer};
pub use version::{VERSION_TIMEOUT, VersionProbe};
pub use workers::process::ProcessSettings;
pub use workers::{
    BuiltinContext, BuiltinParams, BuiltinRegistry, CHANGES_CAPACITY, Change, CollectorFn,
    MetricsBucket, Noop, ProcessHandle, ProcessParams, ProcessWorker, Status, Worker,
};
