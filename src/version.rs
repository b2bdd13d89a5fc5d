//! # Exporter version discovery.
//!
//! Before a process worker starts, its binary is run once as
//! `<exec_path> --version` and the version is extracted from the combined
//! stdout/stderr with a per-kind regex:
//!
//! ```text
//! "node_exporter, version 1.8.2 (branch: HEAD, ...)"
//!        │  pattern  node_exporter, version ([!-~]*)
//!        ▼
//! first capture group ──► "1.8.2"       (whole match if the pattern has no group)
//! ```
//!
//! Kinds without a pattern have no version. Every failure is reported to the
//! caller, which only logs it.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tracing::warn;

use crate::error::VersionError;

/// How long `--version` may take.
pub const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Compiled version patterns by process kind.
#[derive(Clone, Debug, Default)]
pub struct VersionProbe {
    patterns: HashMap<String, Regex>,
}

impl VersionProbe {
    /// Compiles `patterns`; invalid ones are logged and skipped.
    pub fn new(patterns: &HashMap<String, String>) -> Self {
        let mut compiled = HashMap::with_capacity(patterns.len());
        for (kind, raw) in patterns {
            match Regex::new(raw) {
                Ok(re) => {
                    compiled.insert(kind.clone(), re);
                }
                Err(source) => {
                    let err = VersionError::Pattern {
                        kind: kind.clone(),
                        source,
                    };
                    warn!(error = %err, label = err.as_label(), "ignoring version pattern");
                }
            }
        }
        Self { patterns: compiled }
    }

    /// Version of the `kind` binary at `path`; `Ok(None)` if the kind has no pattern.
    pub async fn version(&self, kind: &str, path: &Path) -> Result<Option<String>, VersionError> {
        match self.patterns.get(kind) {
            Some(re) => binary_version(path, &["--version"], re, VERSION_TIMEOUT)
                .await
                .map(Some),
            None => Ok(None),
        }
    }
}

/// Runs `path args…` and matches `pattern` against its output.
pub(crate) async fn binary_version(
    path: &Path,
    args: &[&str],
    pattern: &Regex,
    timeout: Duration,
) -> Result<String, VersionError> {
    let mut cmd = Command::new(path);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(VersionError::Run {
                path: path.to_path_buf(),
                reason: e.to_string(),
            });
        }
        Err(_) => {
            return Err(VersionError::Timeout {
                path: path.to_path_buf(),
            });
        }
    };
    if !output.status.success() {
        return Err(VersionError::Exit {
            path: path.to_path_buf(),
            status: output.status.to_string(),
        });
    }

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push('\n');
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    let caps = pattern.captures(&text).ok_or_else(|| VersionError::NoMatch {
        path: path.to_path_buf(),
    })?;
    let found = caps.get(1).or_else(|| caps.get(0)).map_or("", |m| m.as_str());
    Ok(found.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SH: &str = "/bin/sh";

    fn re(s: &str) -> Regex {
        Regex::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_first_capture_group_is_the_version() {
        let v = binary_version(
            Path::new(SH),
            &["-c", "echo 'node_exporter, version 1.8.2 (branch: HEAD)'"],
            &re(r"node_exporter, version ([!-~]*)"),
            VERSION_TIMEOUT,
        )
        .await
        .unwrap();
        assert_eq!(v, "1.8.2");
    }

    #[tokio::test]
    async fn test_stderr_is_searched_and_whole_match_without_group() {
        let v = binary_version(
            Path::new(SH),
            &["-c", "echo 'v0.15.0' >&2"],
            &re(r"v[0-9.]+"),
            VERSION_TIMEOUT,
        )
        .await
        .unwrap();
        assert_eq!(v, "v0.15.0");
    }

    #[tokio::test]
    async fn test_failures_are_classified() {
        let pattern = re(r"version ([0-9.]+)");

        let err = binary_version(Path::new(SH), &["-c", "echo nothing"], &pattern, VERSION_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.as_label(), "version_no_match");

        let err = binary_version(
            Path::new(SH),
            &["-c", "echo version 1.0; exit 3"],
            &pattern,
            VERSION_TIMEOUT,
        )
        .await
        .unwrap_err();
        assert_eq!(err.as_label(), "version_exit");

        let err = binary_version(Path::new("/nonexistent/exporter"), &[], &pattern, VERSION_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.as_label(), "version_run");

        let err = binary_version(
            Path::new(SH),
            &["-c", "/bin/sleep 5"],
            &pattern,
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert_eq!(err.as_label(), "version_timeout");
    }

    #[tokio::test]
    async fn test_unknown_kind_and_invalid_pattern_have_no_version() {
        let probe = VersionProbe::new(&HashMap::from([("broken".to_string(), "(".to_string())]));
        assert_eq!(probe.version("other", Path::new(SH)).await.unwrap(), None);
        assert_eq!(probe.version("broken", Path::new(SH)).await.unwrap(), None);
    }
}
