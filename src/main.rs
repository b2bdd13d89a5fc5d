//! Agentvisor daemon
//!
//! Loads a supervisor config and a desired-state file, converges to it and
//! logs every status change and metrics payload until a termination signal.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use agentvisor::{DesiredState, Supervisor, SupervisorConfig};

#[derive(Parser, Debug)]
#[command(name = "agentvisor", version)]
#[command(about = "Local supervisor for exporter processes and built-in collectors")]
struct Cli {
    /// Supervisor config (TOML); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Desired state (TOML with `[processes.<id>]` / `[builtins.<id>]` tables)
    #[arg(long)]
    state: Option<PathBuf>,

    /// Forward worker output to the log at debug level
    #[arg(long)]
    debug: bool,
}

fn load_state(path: &Path) -> Result<DesiredState> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading desired state {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing desired state {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.debug { "agentvisor=debug,info" } else { "info" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = match &cli.config {
        Some(path) => SupervisorConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SupervisorConfig::default(),
    };
    cfg.debug |= cli.debug;
    let desired = match &cli.state {
        Some(path) => load_state(path)?,
        None => DesiredState::default(),
    };

    let (sup, outlet) = Supervisor::builder(cfg).build();
    let mut changes = outlet.changes;
    let mut metrics = outlet.metrics;
    let changes_log = tokio::spawn(async move {
        while let Some(ev) = changes.recv().await {
            info!(worker_id = %ev.worker_id, status = %ev.status, port = ?ev.listen_port, "status changed");
        }
    });
    let metrics_log = tokio::spawn(async move {
        while let Some(req) = metrics.recv().await {
            debug!(worker_id = %req.worker_id, buckets = req.buckets.len(), "metrics collected");
        }
    });

    let report = sup.set_state(desired).await?;
    for (id, err) in &report.failed {
        warn!(worker_id = %id, error = %err, label = err.as_label(), "worker not started");
    }

    let signal = agentvisor::wait_for_shutdown_signal()
        .await
        .context("installing signal handlers")?;
    info!(signal, "shutting down");

    sup.shutdown();
    sup.wait_stopped().await;
    let _ = changes_log.await;
    let _ = metrics_log.await;
    Ok(())
}
