//! Running external commands (zpool, docker, upsc, systemctl, ...)

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::trace;

use crate::config::CommandSpec;

/// Run a command to completion and return its stdout
///
/// A non-zero exit status is an error carrying the command's stderr. The child
/// is killed if the returned future is dropped (e.g. by a timeout).
pub async fn run(spec: &CommandSpec) -> Result<String> {
    trace!("running `{spec}`");

    let output = Command::new(&spec.program)
        .args(&spec.args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to spawn `{spec}`"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("`{spec}` exited with {}: {}", output.status, stderr.trim());
    }

    String::from_utf8(output.stdout).with_context(|| format!("`{spec}` wrote non-UTF-8 output"))
}

/// [`run`] bounded by `timeout`
pub async fn run_with_timeout(spec: &CommandSpec, timeout: Duration) -> Result<String> {
    match tokio::time::timeout(timeout, run(spec)).await {
        Ok(result) => result,
        Err(_) => bail!("`{spec}` timed out after {timeout:?}"),
    }
}
