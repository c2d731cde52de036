//! External command execution with timeouts.
//!
//! Used for GPU inventory tools, the container CLI, and the hub downloader.

use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

/// Captured output of a successful command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output, lossily decoded
    pub stdout: String,
    /// Standard error, lossily decoded
    pub stderr: String,
}

/// Run `cmd` to completion within `timeout`.
///
/// Non-zero exit, spawn failure, and timeout all map to `Err` with a
/// human-readable message. The child is killed if the timeout elapses.
pub async fn run_command(
    cmd: &mut Command,
    timeout: Duration,
    description: &str,
) -> Result<CommandOutput, String> {
    debug!("{}", description);
    cmd.kill_on_drop(true);
    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| {
            warn!("{} timed out after {:?}", description, timeout);
            format!("timed out after {:?}", timeout)
        })?
        .map_err(|e| {
            debug!("{} spawn failed: {}", description, e);
            format!("failed to execute: {}", e)
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if output.status.success() {
        Ok(CommandOutput { stdout, stderr })
    } else {
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        debug!("{} failed ({}): {}", description, code, stderr.trim());
        Err(format!("exit {}: {}", code, stderr.trim()))
    }
}
