//! Subprocess supervision for the media toolchain
//!
//! Spawn, await with a hard timeout, collect output. The child is spawned
//! with `kill_on_drop` so an orphaned process is killed when the awaiting
//! task is cancelled or the timeout fires.

use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::types::{PipelineError, Result};

/// Run a toolchain binary to completion, capturing stdout and stderr.
///
/// Returns the raw [`Output`] whatever the exit status; callers translate a
/// non-zero status into their own error kind with the captured stderr.
pub async fn run_tool(program: &str, args: &[String], timeout: Duration) -> Result<Output> {
    debug!(program = program, args = ?args, "spawning toolchain process");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            PipelineError::Internal(format!("failed to spawn {}: {}", program, e))
        })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(PipelineError::Internal(format!(
            "{} timed out after {:?}",
            program, timeout
        ))),
    }
}

/// Stderr of an output, lossily decoded and trimmed
pub fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}
