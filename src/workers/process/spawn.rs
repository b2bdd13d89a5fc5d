//! Child process launching and output capture.

use std::io::Write;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::error::ProcessError;
use crate::logs::LogBuffer;
use crate::template::Invocation;

/// How long to wait for output readers after the child exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// A launched child plus the tasks copying its output into the log buffer.
pub(super) struct Launched {
    pub(super) child: Child,
    pumps: Vec<JoinHandle<()>>,
}

impl Launched {
    /// Waits (bounded) until all output of an exited child has been captured.
    pub(super) async fn drain(&mut self) {
        for pump in self.pumps.drain(..) {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, pump).await;
        }
    }

    /// Waits for the child to exit and its output to be captured.
    pub(super) async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await;
        self.drain().await;
        status
    }
}

/// Launches `path` with a cleared environment, a fixed working directory and
/// both output streams piped into `logs`.
///
/// On Linux the child is killed when the supervisor dies.
pub(super) fn launch(
    path: &Path,
    invocation: &Invocation,
    working_dir: &Path,
    logs: &LogBuffer,
) -> Result<Launched, ProcessError> {
    let mut cmd = Command::new(path);
    cmd.args(&invocation.args)
        .env_clear()
        .envs(invocation.env.iter().filter_map(|kv| kv.split_once('=')))
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    die_with_parent(&mut cmd);

    let mut child = cmd.spawn().map_err(|e| ProcessError::Spawn {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if child.id().is_none() {
        return Err(ProcessError::MissingPid);
    }

    let mut pumps = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(out, logs.clone())));
    }
    if let Some(err) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(err, logs.clone())));
    }

    Ok(Launched { child, pumps })
}

/// Asks the child to exit: SIGTERM on Unix, a hard kill elsewhere.
#[cfg(unix)]
pub(super) fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!(pid, error = %e, "failed to send SIGTERM");
            }
        }
        None => tracing::debug!("process already reaped"),
    }
}

/// Asks the child to exit: SIGTERM on Unix, a hard kill elsewhere.
#[cfg(not(unix))]
pub(super) fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "failed to kill process");
    }
}

/// Makes the kernel SIGKILL the child when the supervisor dies.
#[cfg(target_os = "linux")]
fn die_with_parent(cmd: &mut Command) {
    let hook = || {
        // SAFETY: prctl only changes the calling (child) process's attributes.
        if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) } == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    };
    // SAFETY: the hook does not allocate or take locks between fork and exec.
    unsafe {
        cmd.pre_exec(hook);
    }
}

#[cfg(not(target_os = "linux"))]
fn die_with_parent(_cmd: &mut Command) {}

async fn pump<R: AsyncRead + Unpin>(mut src: R, mut logs: LogBuffer) {
    let mut buf = [0u8; 4096];
    loop {
        match src.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let _ = logs.write_all(&buf[..n]);
            }
        }
    }
}
