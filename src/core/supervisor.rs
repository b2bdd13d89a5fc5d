//! # Supervisor: reconciles running workers against the desired state.
//!
//! The [`Supervisor`] owns the running-worker maps, the [`PortRegistry`], the
//! renderer and the built-in registry. Every mutation happens inside one
//! exclusive lock, so `set_state`, `restart_all` and the shutdown sequence
//! never interleave.
//!
//! ## Key responsibilities
//! - diff the desired state per worker family (processes, built-ins)
//! - stop, restart (keeping the port) and start workers, in that order
//! - forward every worker change to the [`Outlet`](crate::Outlet)
//! - on root-token cancellation: stop everything, close the outlet
//!
//! ## High-level architecture
//! ```text
//! set_state(desired) ──► lock(running) ──► token cancelled? ──► Err(ShuttingDown)
//!                              │
//!                              ├─► processes: diff ──► to_stop    → cancel, await done, release port, cleanup files
//!                              │                  ├─► to_restart → cancel, await done, start on the same port
//!                              │                  └─► to_start   → reserve port, start (≤ start_attempts, fresh port each)
//!                              └─► builtins:  diff ──► to_stop / to_restart / to_start (render dsn, registry[kind])
//!
//! start: render ──► ProcessWorker ──► tokio::spawn(worker.run(child_token, tx))
//!                                     tokio::spawn(forward(rx)) ──► JoinHandle = completion signal
//!        await initialized (≤ start_wait): false → cancel, await done, Err(last_error)
//!
//! Shutdown path:
//!   root token cancelled ──► lock(running) ──► reconcile(empty) ──► drop outlet senders ──► stopped
//! ```
//!
//! ## Example
//! ```rust,no_run
//! use std::collections::HashMap;
//! use agentvisor::{DesiredState, ProcessParams, Supervisor, SupervisorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut cfg = SupervisorConfig::default();
//!     cfg.exec_paths.insert("node_exporter".into(), "/usr/local/bin/node_exporter".into());
//!
//!     let (sup, mut outlet) = Supervisor::builder(cfg).build();
//!     tokio::spawn(async move {
//!         while let Some(ev) = outlet.changes.recv().await {
//!             println!("{} {} {:?}", ev.worker_id, ev.status, ev.listen_port);
//!         }
//!     });
//!
//!     let desired = DesiredState {
//!         processes: HashMap::from([(
//!             "node-1".to_string(),
//!             ProcessParams {
//!                 kind: "node_exporter".into(),
//!                 args: vec!["--web.listen-address=127.0.0.1:{{ .listen_port }}".into()],
//!                 ..ProcessParams::default()
//!             },
//!         )]),
//!         ..DesiredState::default()
//!     };
//!     let report = sup.set_state(desired).await?;
//!     assert!(report.is_ok());
//!
//!     sup.shutdown();
//!     sup.wait_stopped().await;
//!     Ok(())
//! }
//! ```

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, error, info, info_span, warn};

use crate::core::builder::SupervisorBuilder;
use crate::core::config::SupervisorConfig;
use crate::core::forwarder::{Origin, Senders, forward};
use crate::core::reconcile::{DesiredState, ReconcileReport, diff};
use crate::core::statuses::StatusCache;
use crate::error::{ProcessError, SupervisorError};
use crate::logs::LogBuffer;
use crate::ports::PortRegistry;
use crate::template::Render;
use crate::version::VersionProbe;
use crate::workers::builtin::{BuiltinContext, BuiltinParams, BuiltinRegistry};
use crate::workers::process::{ProcessHandle, ProcessParams, ProcessWorker};
use crate::workers::{CHANGES_CAPACITY, Status, Worker};

/// Worker family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerFamily {
    /// External process.
    Process,
    /// In-process built-in.
    Builtin,
}

/// Snapshot of one tracked worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Worker ID.
    pub id: String,
    /// Process or built-in.
    pub family: WorkerFamily,
    /// Kind tag from the params.
    pub kind: String,
    /// Last status seen; `None` before the first one arrives.
    pub status: Option<Status>,
    /// Listen port (process workers only).
    pub listen_port: Option<u16>,
    /// Executable (process workers only).
    pub exec_path: Option<PathBuf>,
    /// Executable version (process workers with a matching version pattern only).
    pub version: Option<String>,
}

struct RunningProcess {
    params: ProcessParams,
    port: u16,
    exec_path: PathBuf,
    version: Option<String>,
    cancel: CancellationToken,
    done: JoinHandle<()>,
    handle: ProcessHandle,
}

struct RunningBuiltin {
    params: BuiltinParams,
    cancel: CancellationToken,
    done: JoinHandle<()>,
    logs: LogBuffer,
}

struct Running {
    processes: HashMap<String, RunningProcess>,
    builtins: HashMap<String, RunningBuiltin>,
    outlet: Option<Senders>,
}

/// Keeps local workers converged to the last desired state.
pub struct Supervisor {
    cfg: SupervisorConfig,
    token: CancellationToken,
    stopped: CancellationToken,
    ports: PortRegistry,
    renderer: Arc<dyn Render>,
    builtins: BuiltinRegistry,
    versions: VersionProbe,
    running: Mutex<Running>,
    statuses: Arc<StatusCache>,
}

impl Supervisor {
    /// Returns a builder for a supervisor with the given configuration.
    pub fn builder(cfg: SupervisorConfig) -> SupervisorBuilder {
        SupervisorBuilder::new(cfg)
    }

    pub(crate) fn new_internal(
        cfg: SupervisorConfig,
        token: CancellationToken,
        renderer: Arc<dyn Render>,
        builtins: BuiltinRegistry,
        outlet: Senders,
    ) -> Self {
        let ports = PortRegistry::new(
            cfg.ports.min,
            cfg.ports.max,
            cfg.ports.reserved.iter().copied(),
        );
        let versions = VersionProbe::new(&cfg.version_patterns);
        Self {
            cfg,
            token,
            stopped: CancellationToken::new(),
            ports,
            renderer,
            builtins,
            versions,
            running: Mutex::new(Running {
                processes: HashMap::new(),
                builtins: HashMap::new(),
                outlet: Some(outlet),
            }),
            statuses: Arc::new(StatusCache::new()),
        }
    }

    /// Converges running workers to `desired`.
    ///
    /// Blocks until every stop and restart of this call has completed. Per-worker
    /// failures are listed in the report; the call as a whole only fails with
    /// [`SupervisorError::ShuttingDown`].
    pub async fn set_state(&self, desired: DesiredState) -> Result<ReconcileReport, SupervisorError> {
        let mut running = self.running.lock().await;
        if self.token.is_cancelled() {
            warn!("set_state rejected: supervisor is shutting down");
            return Err(SupervisorError::ShuttingDown);
        }

        let report = self.reconcile(&mut running, desired).await;
        info!(
            started = report.started.len(),
            restarted = report.restarted.len(),
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            "state applied"
        );
        Ok(report)
    }

    /// Restarts every running worker with its current params; processes keep their ports.
    pub async fn restart_all(&self) -> Result<ReconcileReport, SupervisorError> {
        let mut running = self.running.lock().await;
        if self.token.is_cancelled() {
            warn!("restart_all rejected: supervisor is shutting down");
            return Err(SupervisorError::ShuttingDown);
        }

        let mut report = ReconcileReport::default();

        let mut ids: Vec<String> = running.processes.keys().cloned().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(params) = running.processes.get(&id).map(|p| p.params.clone()) {
                self.restart_process(&mut running, id, params, &mut report).await;
            }
        }

        let mut ids: Vec<String> = running.builtins.keys().cloned().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(params) = running.builtins.get(&id).map(|b| b.params.clone()) {
                self.restart_builtin(&mut running, id, params, &mut report).await;
            }
        }

        info!(restarted = report.restarted.len(), failed = report.failed.len(), "all workers restarted");
        Ok(report)
    }

    /// Every tracked worker, sorted by ID.
    pub async fn workers_list(&self) -> Vec<WorkerInfo> {
        let running = self.running.lock().await;
        let statuses = self.statuses.read().await;

        let processes = running.processes.iter().map(|(id, p)| WorkerInfo {
            id: id.clone(),
            family: WorkerFamily::Process,
            kind: p.params.kind.clone(),
            status: statuses.get(id).copied(),
            listen_port: Some(p.port),
            exec_path: Some(p.exec_path.clone()),
            version: p.version.clone(),
        });
        let builtins = running.builtins.iter().map(|(id, b)| WorkerInfo {
            id: id.clone(),
            family: WorkerFamily::Builtin,
            kind: b.params.kind.clone(),
            status: statuses.get(id).copied(),
            listen_port: None,
            exec_path: None,
            version: None,
        });

        let mut list: Vec<WorkerInfo> = processes.chain(builtins).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Retained log lines of one worker, oldest first.
    pub async fn worker_logs(&self, id: &str) -> Option<Vec<String>> {
        let running = self.running.lock().await;
        if let Some(p) = running.processes.get(id) {
            return Some(p.handle.logs());
        }
        running.builtins.get(id).map(|b| b.logs.latest())
    }

    /// Retained log lines of every worker, keyed by `"<kind> <id>"`.
    pub async fn all_logs(&self) -> BTreeMap<String, Vec<String>> {
        let running = self.running.lock().await;
        let processes = running
            .processes
            .iter()
            .map(|(id, p)| (format!("{} {}", p.params.kind, id), p.handle.logs()));
        let builtins = running
            .builtins
            .iter()
            .map(|(id, b)| (format!("{} {}", b.params.kind, id), b.logs.latest()));
        processes.chain(builtins).collect()
    }

    /// Why a process worker failed to initialize, if it did.
    pub async fn last_error(&self, id: &str) -> Option<ProcessError> {
        let running = self.running.lock().await;
        running.processes.get(id).and_then(|p| p.handle.last_error())
    }

    /// Cancels the root token: every worker is stopped and the outlet closes.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// `true` once shutdown was requested.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves after shutdown has stopped every worker.
    pub async fn wait_stopped(&self) {
        self.stopped.cancelled().await;
    }

    /// Waits for the root token, then stops everything. Spawned once by the builder.
    pub(crate) async fn run_until_cancelled(self: Arc<Self>) {
        self.token.cancelled().await;
        info!("shutdown requested, stopping all workers");

        let mut running = self.running.lock().await;
        let report = self.reconcile(&mut running, DesiredState::default()).await;
        running.outlet = None;
        drop(running);

        info!(stopped = report.stopped.len(), "Done.");
        self.stopped.cancel();
    }

    async fn reconcile(&self, running: &mut Running, desired: DesiredState) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        self.reconcile_processes(running, desired.processes, &mut report).await;
        self.reconcile_builtins(running, desired.builtins, &mut report).await;
        report
    }

    // ---------------------------
    // Process workers
    // ---------------------------

    async fn reconcile_processes(
        &self,
        running: &mut Running,
        mut desired: HashMap<String, ProcessParams>,
        report: &mut ReconcileReport,
    ) {
        let plan = diff(&running.processes, &desired, |p| &p.params);

        for id in plan.to_stop {
            if let Some(p) = running.processes.remove(&id) {
                self.stop_process(&id, p, true).await;
                report.stopped.push(id);
            }
        }

        for id in plan.to_restart {
            if let Some(params) = desired.remove(&id) {
                self.restart_process(running, id, params, report).await;
            }
        }

        for id in plan.to_start {
            let Some(params) = desired.remove(&id) else {
                continue;
            };
            match self.start_process(running.outlet.as_ref(), &id, params, None).await {
                Ok(p) => {
                    running.processes.insert(id.clone(), p);
                    report.started.push(id);
                }
                Err(e) => {
                    warn!(worker_id = %id, error = %e, label = e.as_label(), "failed to start process");
                    report.failed.push((id, e));
                }
            }
        }
    }

    async fn restart_process(
        &self,
        running: &mut Running,
        id: String,
        params: ProcessParams,
        report: &mut ReconcileReport,
    ) {
        let Some(old) = running.processes.remove(&id) else {
            return;
        };
        let port = old.port;
        self.stop_process(&id, old, false).await;

        match self.start_process(running.outlet.as_ref(), &id, params, Some(port)).await {
            Ok(p) => {
                running.processes.insert(id.clone(), p);
                report.restarted.push(id);
            }
            Err(e) => {
                warn!(worker_id = %id, error = %e, label = e.as_label(), "failed to restart process");
                report.failed.push((id, e));
            }
        }
    }

    /// Cancels, waits for completion and, if `release`, frees the port and rendered files.
    async fn stop_process(&self, id: &str, p: RunningProcess, release: bool) {
        p.cancel.cancel();
        if let Err(e) = p.done.await {
            error!(worker_id = %id, error = %e, "forwarding task failed");
        }
        if release {
            self.release_port(id, p.port);
            self.remove_rendered(&p.params.kind, id);
        }
    }

    /// Starts a process, retrying initialization failures on fresh ports.
    ///
    /// Owns the port from here on: it is released again on failure, together
    /// with any files rendered for the worker.
    async fn start_process(
        &self,
        outlet: Option<&Senders>,
        id: &str,
        params: ProcessParams,
        reuse_port: Option<u16>,
    ) -> Result<RunningProcess, SupervisorError> {
        let prepared = outlet
            .ok_or(SupervisorError::ShuttingDown)
            .and_then(|outlet| Ok((outlet, self.cfg.exec_path(&params.kind)?.to_path_buf())));
        let (outlet, exec_path) = match prepared {
            Ok(v) => v,
            Err(e) => {
                if let Some(port) = reuse_port {
                    self.release_port(id, port);
                }
                return Err(e);
            }
        };

        let version = match self.versions.version(&params.kind, &exec_path).await {
            Ok(v) => v,
            Err(e) => {
                warn!(worker_id = %id, error = %e, label = e.as_label(), "cannot determine version");
                None
            }
        };

        let res = self
            .start_with_retries(outlet, id, &params, &exec_path, version, reuse_port)
            .await;
        if res.is_err() {
            self.remove_rendered(&params.kind, id);
        }
        res
    }

    async fn start_with_retries(
        &self,
        outlet: &Senders,
        id: &str,
        params: &ProcessParams,
        exec_path: &Path,
        version: Option<String>,
        reuse_port: Option<u16>,
    ) -> Result<RunningProcess, SupervisorError> {
        let mut port = match reuse_port {
            Some(port) => port,
            None => self.ports.reserve()?,
        };
        let attempts = self.cfg.start_attempts_clamped();
        let mut attempt = 1;
        loop {
            match self
                .start_process_once(outlet, id, params, exec_path, version.clone(), port)
                .await
            {
                Ok(p) => return Ok(p),
                Err(e) => {
                    self.release_port(id, port);
                    if !e.is_retryable() || attempt >= attempts {
                        return Err(e);
                    }
                    warn!(worker_id = %id, attempt, error = %e, "start failed, retrying on a fresh port");
                    attempt += 1;
                    port = self.ports.reserve()?;
                }
            }
        }
    }

    async fn start_process_once(
        &self,
        outlet: &Senders,
        id: &str,
        params: &ProcessParams,
        exec_path: &Path,
        version: Option<String>,
        port: u16,
    ) -> Result<RunningProcess, SupervisorError> {
        let span = info_span!("worker", worker_id = %id, kind = %params.kind, port);
        let invocation = self.renderer.render_process(id, params, port)?;

        let redact: Vec<&str> = params
            .redact_words
            .iter()
            .map(String::as_str)
            .filter(|w| !w.is_empty())
            .collect();
        let logs = LogBuffer::new(self.cfg.log_lines, &redact, self.cfg.debug).with_span(span.clone());

        let (worker, handle) =
            ProcessWorker::new(exec_path, invocation, self.cfg.process_settings(), logs);
        let renderer = Arc::clone(&self.renderer);
        let (rid, rparams) = (id.to_string(), params.clone());
        let worker = worker.with_rerender(move || renderer.render_process(&rid, &rparams, port));

        let origin = Origin {
            worker_id: id.to_string(),
            listen_port: Some(port),
            exec_path: Some(exec_path.to_path_buf()),
            version: version.clone(),
        };
        let (cancel, done) = self.spawn_worker(Box::new(worker), origin, outlet.clone(), span.clone());

        match tokio::time::timeout(self.cfg.start_wait, handle.initialized()).await {
            Ok(true) => info!(parent: &span, "process started"),
            Ok(false) => {
                cancel.cancel();
                let _ = done.await;
                let err = handle.last_error().unwrap_or(ProcessError::ExitedEarly {
                    status: "unknown".into(),
                });
                return Err(err.into());
            }
            Err(_) => warn!(parent: &span, start_wait = ?self.cfg.start_wait, "no initialization verdict yet, keeping process"),
        }

        Ok(RunningProcess {
            params: params.clone(),
            port,
            exec_path: exec_path.to_path_buf(),
            version,
            cancel,
            done,
            handle,
        })
    }

    fn remove_rendered(&self, kind: &str, id: &str) {
        if let Err(e) = self.renderer.cleanup(kind, id) {
            warn!(worker_id = %id, error = %e, "failed to remove rendered files");
        }
    }

    fn release_port(&self, id: &str, port: u16) {
        if let Err(e) = self.ports.release(port) {
            warn!(worker_id = %id, port, error = %e, label = e.as_label(), "failed to release port");
        }
    }

    // ---------------------------
    // Built-in workers
    // ---------------------------

    async fn reconcile_builtins(
        &self,
        running: &mut Running,
        mut desired: HashMap<String, BuiltinParams>,
        report: &mut ReconcileReport,
    ) {
        let plan = diff(&running.builtins, &desired, |b| &b.params);

        for id in plan.to_stop {
            if let Some(b) = running.builtins.remove(&id) {
                self.stop_builtin(&id, b, true).await;
                report.stopped.push(id);
            }
        }

        for id in plan.to_restart {
            if let Some(params) = desired.remove(&id) {
                self.restart_builtin(running, id, params, report).await;
            }
        }

        for id in plan.to_start {
            let Some(params) = desired.remove(&id) else {
                continue;
            };
            match self.start_builtin(running.outlet.as_ref(), &id, params) {
                Ok(b) => {
                    running.builtins.insert(id.clone(), b);
                    report.started.push(id);
                }
                Err(e) => {
                    warn!(worker_id = %id, error = %e, label = e.as_label(), "failed to start built-in");
                    report.failed.push((id, e));
                }
            }
        }
    }

    async fn restart_builtin(
        &self,
        running: &mut Running,
        id: String,
        params: BuiltinParams,
        report: &mut ReconcileReport,
    ) {
        let Some(old) = running.builtins.remove(&id) else {
            return;
        };
        self.stop_builtin(&id, old, false).await;

        match self.start_builtin(running.outlet.as_ref(), &id, params) {
            Ok(b) => {
                running.builtins.insert(id.clone(), b);
                report.restarted.push(id);
            }
            Err(e) => {
                warn!(worker_id = %id, error = %e, label = e.as_label(), "failed to restart built-in");
                report.failed.push((id, e));
            }
        }
    }

    async fn stop_builtin(&self, id: &str, b: RunningBuiltin, cleanup: bool) {
        b.cancel.cancel();
        if let Err(e) = b.done.await {
            error!(worker_id = %id, error = %e, "forwarding task failed");
        }
        if cleanup {
            self.remove_rendered(&b.params.kind, id);
        }
    }

    fn start_builtin(
        &self,
        outlet: Option<&Senders>,
        id: &str,
        params: BuiltinParams,
    ) -> Result<RunningBuiltin, SupervisorError> {
        let outlet = outlet.ok_or(SupervisorError::ShuttingDown)?;
        let span = info_span!("worker", worker_id = %id, kind = %params.kind);

        let dsn = self.renderer.render_dsn(id, &params)?;
        let logs = LogBuffer::new(self.cfg.log_lines, &[] as &[&str], self.cfg.debug)
            .with_span(span.clone());
        let worker = self.builtins.build(BuiltinContext {
            id: id.to_string(),
            params: params.clone(),
            dsn,
            logs: logs.clone(),
            backoff: self.cfg.backoff,
        })?;

        let origin = Origin {
            worker_id: id.to_string(),
            listen_port: None,
            exec_path: None,
            version: None,
        };
        let (cancel, done) = self.spawn_worker(worker, origin, outlet.clone(), span.clone());
        info!(parent: &span, "built-in started");

        Ok(RunningBuiltin {
            params,
            cancel,
            done,
            logs,
        })
    }

    // ---------------------------
    // Helpers
    // ---------------------------

    /// Spawns the worker and its forwarding task; returns the cancel handle and completion signal.
    fn spawn_worker(
        &self,
        worker: Box<dyn Worker>,
        origin: Origin,
        outlet: Senders,
        span: Span,
    ) -> (CancellationToken, JoinHandle<()>) {
        let cancel = self.token.child_token();
        let (tx, rx) = mpsc::channel(CHANGES_CAPACITY);

        let run = AssertUnwindSafe(worker.run(cancel.clone(), tx)).catch_unwind();
        tokio::spawn(
            async move {
                if let Err(panic) = run.await {
                    error!(panic = panic_message(&*panic), "worker panicked");
                }
            }
            .instrument(span.clone()),
        );

        let done = tokio::spawn(
            forward(rx, origin, Arc::clone(&self.statuses), outlet).instrument(span),
        );
        (cancel, done)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
