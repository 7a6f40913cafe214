use std::path::Path;

use tokio::process::Command;
use tracing::trace;

/// Error from a failed CLI invocation.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

fn display(program: &Path, args: &[&str]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.display().to_string());
    parts.extend(args.iter().map(|a| (*a).to_string()));
    parts.join(" ")
}

/// Run `program args...` to completion and return trimmed stdout.
pub async fn exec(program: &Path, args: &[&str]) -> Result<String, CommandError> {
    let cmd_display = display(program, args);
    trace!(command = %cmd_display, "exec");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| CommandError {
            command: cmd_display.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(CommandError {
            command: cmd_display,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Run a command for its side effect; failures are only traced.
pub async fn exec_ignore_errors(program: &Path, args: &[&str]) {
    if let Err(e) = exec(program, args).await {
        trace!(command = %e.command, detail = %e.detail, "command failed (ignored)");
    }
}
