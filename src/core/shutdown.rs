//! # Termination signals for the daemon.
//!
//! [`wait_for_shutdown_signal`] completes on the first of:
//! - `SIGINT` / Ctrl-C
//! - `SIGTERM` (systemd stop)
//! - `SIGQUIT`
//!
//! On non-Unix platforms only Ctrl-C is watched.
//!
//! The supervisor does not install this itself; the caller decides what a
//! signal means and cancels the root token (see the `agentvisor` binary).

/// Waits for a termination signal and returns its name.
///
/// Returns `Err` if a listener cannot be registered.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = sigint.recv()  => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    };
    Ok(name)
}

/// Waits for a termination signal and returns its name.
///
/// Returns `Err` if a listener cannot be registered.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("CTRL_C")
}
