//! Helpers for running host networking tools (`ip`, `nft`).

use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Failed to execute {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed with status {status}: {stderr}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Run a system command and return its stdout.
pub async fn run_command(cmd: &str, args: &[&str]) -> Result<String, CommandError> {
    run_command_with_input(cmd, args, None).await
}

/// Run a system command, feeding `input` on stdin when given.
pub async fn run_command_with_input(
    cmd: &str,
    args: &[&str],
    input: Option<&str>,
) -> Result<String, CommandError> {
    debug!("Running command: {} {:?}", cmd, args);

    let spawn_error = |source| CommandError::Spawn {
        command: cmd.to_string(),
        source,
    };

    let mut child = Command::new(cmd)
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(spawn_error)?;

    if let (Some(text), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin.write_all(text.as_bytes()).await.map_err(spawn_error)?;
    }

    let output = child.wait_with_output().await.map_err(spawn_error)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        error!("Command failed: {} {:?}: {}", cmd, args, stderr);
        return Err(CommandError::Failed {
            command: cmd.to_string(),
            status: output.status,
            stderr,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
