//! # Process worker: one external binary under a restart state machine.
//!
//! ```text
//!              spawn ok, alive after running_after
//!   STARTING ─────────────────────────────────────► RUNNING ──── ctx cancelled ───► STOPPING
//!    │   ▲                                             │                              │
//!    │   │ backoff elapsed (re-render)                 │ exited on its own            │ SIGTERM,
//!    │   └────────────── WAITING ◄─────────────────────┘                              │ SIGKILL after
//!    │                      │                                                         │ kill_after
//!    │ spawn failed /       └──── ctx cancelled ───────────────────────────► DONE ◄───┘
//!    │ exited early                                                           ▲
//!    └─► INITIALIZATION_ERROR ────────────────────────────────────────────────┘
//! ```
//!
//! ## Rules
//! - The status of a state is sent before the state does anything.
//! - Cancellation is not observed in `STARTING`: a started process always
//!   reports `RUNNING` (or fails) before it can be stopped.
//! - The backoff generator is reset on every `RUNNING`.
//! - Once the process has reached `RUNNING`, later launch failures and early
//!   exits are crashes: they go to `WAITING`, not `INITIALIZATION_ERROR`.

mod spawn;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::spawn::{Launched, launch, terminate};
use crate::error::{ProcessError, RenderError};
use crate::logs::LogBuffer;
use crate::policies::{Backoff, BackoffPolicy};
use crate::template::{Delims, Invocation};
use crate::workers::{Change, Status, Worker, emit};

/// Desired parameters of a process worker, compared structurally before rendering.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProcessParams {
    /// Kind tag, e.g. `node_exporter`. Selects the executable.
    pub kind: String,
    /// Argument templates.
    pub args: Vec<String>,
    /// Environment templates in `KEY=VALUE` form.
    pub env: Vec<String>,
    /// Text file name → body template.
    pub text_files: BTreeMap<String, String>,
    /// Placeholder delimiters; `{{` / `}}` when unset.
    pub template_delims: Option<Delims>,
    /// Literals replaced with `***` in captured output.
    pub redact_words: Vec<String>,
}

/// Timing and launch settings shared by all process workers.
#[derive(Clone, Debug)]
pub struct ProcessSettings {
    /// Grace window separating "started" from "exited immediately".
    pub running_after: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub kill_after: Duration,
    /// Restart pacing after crashes.
    pub backoff: BackoffPolicy,
    /// Working directory of every child.
    pub working_dir: PathBuf,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            running_after: Duration::from_secs(1),
            kill_after: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            working_dir: PathBuf::from("/"),
        }
    }
}

type Rerender = Box<dyn Fn() -> Result<Invocation, RenderError> + Send + Sync>;

struct Shared {
    last_error: Mutex<Option<ProcessError>>,
    initialized: watch::Sender<Option<bool>>,
}

/// Owner-side view of a [`ProcessWorker`] that outlives the move into `run`.
#[derive(Clone)]
pub struct ProcessHandle {
    shared: Arc<Shared>,
    logs: LogBuffer,
}

impl ProcessHandle {
    /// Retained output lines, oldest first.
    pub fn logs(&self) -> Vec<String> {
        self.logs.latest()
    }

    /// Why the process could not be initialized, if it could not.
    pub fn last_error(&self) -> Option<ProcessError> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Resolves once the first start either reached `RUNNING` (`true`) or failed (`false`).
    pub async fn initialized(&self) -> bool {
        let mut rx = self.shared.initialized.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(verdict) => *verdict == Some(true),
            Err(_) => false,
        }
    }
}

/// Where the state machine is.
enum State {
    Starting { restart: bool },
    Running(Launched),
    Waiting,
    Stopping(Launched),
    Failed(ProcessError),
    Done,
}

/// A supervised external process.
pub struct ProcessWorker {
    path: PathBuf,
    invocation: Invocation,
    settings: ProcessSettings,
    backoff: Backoff,
    rerender: Option<Rerender>,
    ran: bool,
    shared: Arc<Shared>,
    logs: LogBuffer,
}

impl ProcessWorker {
    /// Creates a worker for `path` and the handle to observe it.
    pub fn new(
        path: impl Into<PathBuf>,
        invocation: Invocation,
        settings: ProcessSettings,
        logs: LogBuffer,
    ) -> (Self, ProcessHandle) {
        let shared = Arc::new(Shared {
            last_error: Mutex::new(None),
            initialized: watch::Sender::new(None),
        });
        let handle = ProcessHandle {
            shared: Arc::clone(&shared),
            logs: logs.clone(),
        };
        let worker = Self {
            path: path.into(),
            invocation,
            backoff: Backoff::with_policy(settings.backoff),
            settings,
            rerender: None,
            ran: false,
            shared,
            logs,
        };
        (worker, handle)
    }

    /// Re-renders the invocation with `f` before every restart after a crash.
    ///
    /// A failed re-render is logged and the previous invocation is reused.
    pub fn with_rerender(
        mut self,
        f: impl Fn() -> Result<Invocation, RenderError> + Send + Sync + 'static,
    ) -> Self {
        self.rerender = Some(Box::new(f));
        self
    }

    async fn starting(&mut self, restart: bool) -> State {
        if restart {
            if let Some(rerender) = &self.rerender {
                match rerender() {
                    Ok(inv) => self.invocation = inv,
                    Err(e) => warn!(error = %e, label = e.as_label(), "re-render failed, using previous invocation"),
                }
            }
        }

        let mut launched = match launch(
            &self.path,
            &self.invocation,
            &self.settings.working_dir,
            &self.logs,
        ) {
            Ok(l) => l,
            Err(e) => return self.start_failed(e),
        };
        debug!(path = %self.path.display(), pid = launched.child.id(), "process started");

        let exited = tokio::select! {
            _ = tokio::time::sleep(self.settings.running_after) => None,
            res = launched.wait() => Some(res),
        };
        match exited {
            None => State::Running(launched),
            Some(res) => {
                let status = match res {
                    Ok(s) => s.to_string(),
                    Err(e) => e.to_string(),
                };
                self.start_failed(ProcessError::ExitedEarly { status })
            }
        }
    }

    fn start_failed(&mut self, err: ProcessError) -> State {
        if self.ran {
            warn!(error = %err, label = err.as_label(), "restart failed");
            State::Waiting
        } else {
            State::Failed(err)
        }
    }

    async fn running(&mut self, mut launched: Launched, ctx: &CancellationToken) -> State {
        self.backoff.reset();
        if !self.ran {
            self.ran = true;
            self.shared.initialized.send_replace(Some(true));
        }

        let exited = tokio::select! {
            _ = ctx.cancelled() => None,
            res = launched.wait() => Some(res),
        };
        match exited {
            None => State::Stopping(launched),
            Some(Ok(status)) => {
                info!(%status, "process exited");
                State::Waiting
            }
            Some(Err(e)) => {
                warn!(error = %e, "failed to wait for process");
                State::Waiting
            }
        }
    }

    async fn waiting(&mut self, ctx: &CancellationToken) -> State {
        let delay = self.backoff.delay();
        info!(?delay, "restarting after backoff");
        tokio::select! {
            _ = ctx.cancelled() => State::Done,
            _ = tokio::time::sleep(delay) => State::Starting { restart: true },
        }
    }

    async fn stopping(&mut self, mut launched: Launched) -> State {
        terminate(&mut launched.child);
        match tokio::time::timeout(self.settings.kill_after, launched.wait()).await {
            Ok(Ok(status)) => debug!(%status, "process stopped"),
            Ok(Err(e)) => warn!(error = %e, "failed to wait for process"),
            Err(_) => {
                warn!(kill_after = ?self.settings.kill_after, "process did not exit, killing");
                if let Err(e) = launched.child.kill().await {
                    warn!(error = %e, "failed to kill process");
                }
                launched.drain().await;
            }
        }
        State::Done
    }

    fn failed(&mut self, err: ProcessError) -> State {
        warn!(error = %err, label = err.as_label(), "process failed to initialize");
        *self.shared.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
        self.shared.initialized.send_replace(Some(false));
        State::Done
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    async fn run(self: Box<Self>, ctx: CancellationToken, changes: mpsc::Sender<Change>) {
        let mut this = *self;
        let mut state = State::Starting { restart: false };
        loop {
            state = match state {
                State::Starting { restart } => {
                    emit(&changes, Status::Starting).await;
                    this.starting(restart).await
                }
                State::Running(launched) => {
                    emit(&changes, Status::Running).await;
                    this.running(launched, &ctx).await
                }
                State::Waiting => {
                    emit(&changes, Status::Waiting).await;
                    this.waiting(&ctx).await
                }
                State::Stopping(launched) => {
                    emit(&changes, Status::Stopping).await;
                    this.stopping(launched).await
                }
                State::Failed(err) => {
                    emit(&changes, Status::InitializationError).await;
                    this.failed(err)
                }
                State::Done => {
                    emit(&changes, Status::Done).await;
                    break;
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: &[&str] = &[];

    fn settings() -> ProcessSettings {
        ProcessSettings {
            running_after: Duration::from_millis(200),
            kill_after: Duration::from_secs(2),
            backoff: BackoffPolicy {
                min: Duration::from_millis(50),
                max: Duration::from_millis(100),
                ..BackoffPolicy::default()
            },
            working_dir: PathBuf::from("/"),
        }
    }

    fn start(
        path: &str,
        args: &[&str],
        logs: LogBuffer,
    ) -> (CancellationToken, mpsc::Receiver<Change>, ProcessHandle) {
        start_with(settings(), path, args, logs)
    }

    fn start_with(
        settings: ProcessSettings,
        path: &str,
        args: &[&str],
        logs: LogBuffer,
    ) -> (CancellationToken, mpsc::Receiver<Change>, ProcessHandle) {
        let inv = Invocation {
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Invocation::default()
        };
        let (worker, handle) = ProcessWorker::new(path, inv, settings, logs);
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(10);
        tokio::spawn(Box::new(worker).run(token.clone(), tx));
        (token, rx, handle)
    }

    async fn next_status(rx: &mut mpsc::Receiver<Change>) -> Option<Status> {
        rx.recv().await.and_then(|c| c.status)
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (token, mut rx, handle) = start("/bin/sleep", &["100500"], LogBuffer::new(10, NONE, false));

        assert_eq!(next_status(&mut rx).await, Some(Status::Starting));
        assert_eq!(next_status(&mut rx).await, Some(Status::Running));
        assert!(handle.initialized().await);

        token.cancel();
        assert_eq!(next_status(&mut rx).await, Some(Status::Stopping));
        assert_eq!(next_status(&mut rx).await, Some(Status::Done));
        assert!(rx.recv().await.is_none());
        assert_eq!(handle.last_error(), None);
    }

    #[tokio::test]
    async fn test_cancel_while_starting_still_reports_running() {
        let (token, mut rx, _handle) = start("/bin/sleep", &["100500"], LogBuffer::new(10, NONE, false));
        assert_eq!(next_status(&mut rx).await, Some(Status::Starting));
        token.cancel();

        let mut rest = Vec::new();
        while let Some(s) = next_status(&mut rx).await {
            rest.push(s);
        }
        assert_eq!(rest, vec![Status::Running, Status::Stopping, Status::Done]);
    }

    #[tokio::test]
    async fn test_missing_binary_is_initialization_error() {
        let (_token, mut rx, handle) =
            start("/nonexistent/exporter", &[], LogBuffer::new(10, NONE, false));

        assert_eq!(next_status(&mut rx).await, Some(Status::Starting));
        assert_eq!(next_status(&mut rx).await, Some(Status::InitializationError));
        assert_eq!(next_status(&mut rx).await, Some(Status::Done));
        assert!(rx.recv().await.is_none());

        assert!(!handle.initialized().await);
        assert!(matches!(handle.last_error(), Some(ProcessError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_early_exit_is_initialization_error() {
        let (_token, mut rx, handle) = start("/bin/false", &[], LogBuffer::new(10, NONE, false));

        assert_eq!(next_status(&mut rx).await, Some(Status::Starting));
        assert_eq!(next_status(&mut rx).await, Some(Status::InitializationError));
        assert_eq!(next_status(&mut rx).await, Some(Status::Done));
        assert!(matches!(handle.last_error(), Some(ProcessError::ExitedEarly { .. })));
    }

    #[tokio::test]
    async fn test_crash_after_running_restarts() {
        let (token, mut rx, _handle) = start(
            "/bin/sh",
            &["-c", "/bin/sleep 0.5; exit 1"],
            LogBuffer::new(10, NONE, false),
        );

        for expected in [
            Status::Starting,
            Status::Running,
            Status::Waiting,
            Status::Starting,
            Status::Running,
        ] {
            assert_eq!(next_status(&mut rx).await, Some(expected));
        }

        token.cancel();
        assert_eq!(next_status(&mut rx).await, Some(Status::Stopping));
        assert_eq!(next_status(&mut rx).await, Some(Status::Done));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_goes_straight_to_done() {
        let mut slow = settings();
        slow.backoff.min = Duration::from_secs(30);
        slow.backoff.max = Duration::from_secs(60);
        let (token, mut rx, _handle) = start_with(
            slow,
            "/bin/sh",
            &["-c", "/bin/sleep 0.3; exit 1"],
            LogBuffer::new(10, NONE, false),
        );

        let mut seen = Vec::new();
        while let Some(s) = next_status(&mut rx).await {
            seen.push(s);
            if s == Status::Waiting {
                token.cancel();
            }
        }
        assert_eq!(
            seen,
            vec![Status::Starting, Status::Running, Status::Waiting, Status::Done]
        );
    }

    #[tokio::test]
    async fn test_output_is_captured_redacted_and_env_is_not_inherited() {
        let logs = LogBuffer::new(10, &["s3cret"], false);
        let (_token, mut rx, handle) = start(
            "/bin/sh",
            &["-c", "echo \"home=[$HOME]\"; echo token=s3cret >&2"],
            logs,
        );

        while next_status(&mut rx).await.is_some() {}

        let mut lines = handle.logs();
        lines.sort();
        assert_eq!(lines, vec!["home=[]", "token=***"]);
    }

    #[tokio::test]
    async fn test_sigkill_after_kill_after() {
        let (token, mut rx, _handle) = start(
            "/bin/sh",
            &["-c", "trap '' TERM; while true; do /bin/sleep 0.1; done"],
            LogBuffer::new(10, NONE, false),
        );
        assert_eq!(next_status(&mut rx).await, Some(Status::Starting));
        assert_eq!(next_status(&mut rx).await, Some(Status::Running));

        token.cancel();
        assert_eq!(next_status(&mut rx).await, Some(Status::Stopping));
        // a second cancel while STOPPING changes nothing
        token.cancel();
        let done = tokio::time::timeout(Duration::from_secs(10), next_status(&mut rx)).await;
        assert_eq!(done.ok().flatten(), Some(Status::Done));
        assert!(rx.recv().await.is_none());
    }
}
