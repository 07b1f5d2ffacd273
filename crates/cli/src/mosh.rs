//! Spawn the interactive terminal client.
//!
//! mosh inherits the terminal; mpf keeps the tunnel alive in the
//! background and proxies SIGINT/SIGTERM to the child. In dev mode a plain
//! line reader replaces mosh so the tunnel can be exercised headless.

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use common::{Error, Result};

/// Run the terminal client until it exits; returns its exit code.
pub async fn run(target: &str, extra_args: &[String]) -> Result<i32> {
    if common::is_dev() {
        println!(">>> Dev mode active. mosh will not be started.");
        println!(">>> Type 'exit' to terminate the session.");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim() == "exit" {
                break;
            }
        }
        return Ok(0);
    }

    let mut command = tokio::process::Command::new("mosh");
    command.arg(target).args(extra_args);

    let mut child = command
        .spawn()
        .map_err(|e| Error::Protocol(format!("mosh not found in PATH: {e}")))?;

    info!(%target, "mosh started");

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status?;
                    return Ok(status.code().unwrap_or(0));
                }
                _ = sigint.recv() => forward_signal(&child, libc::SIGINT),
                _ = sigterm.recv() => forward_signal(&child, libc::SIGTERM),
            }
        }
    }

    #[cfg(not(unix))]
    {
        let status = child.wait().await?;
        Ok(status.code().unwrap_or(0))
    }
}

#[cfg(unix)]
fn forward_signal(child: &tokio::process::Child, signal: i32) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, signal);
        }
    }
}
