//! Remote binary deployment.
//!
//! Before starting the agent the master makes sure the remote binary
//! reports the local version. When the architectures line up (and the
//! local OS is Linux), the current executable is streamed over the SSH
//! channel; otherwise the remote downloads the matching release archive.

use tracing::{info, warn};

use common::{Error, Result};
use protocol::PROTOCOL_VERSION;

use crate::ssh::SshSession;

/// Default install location on the remote host.
pub const DEFAULT_REMOTE_PATH: &str = "~/.local/bin/mpf";

/// Release archive location: `{repo}/releases/download/v{ver}/mpf-v{ver}-linux-{arch}.tar.gz`.
const RELEASE_REPO: &str = "https://github.com/mpf-dev/mpf";

/// Ensure a matching agent binary at `remote_path`; returns the path
/// relative to the remote home directory (as used in exec commands).
pub async fn deploy_agent(ssh: &SshSession, remote_path: &str, force: bool) -> Result<String> {
    let remote_path = remote_path
        .strip_prefix("~/")
        .unwrap_or(remote_path)
        .to_string();

    let mut should_deploy = force;

    if force {
        // Stop a running agent first so the overwrite doesn't hit
        // "text file busy".
        let _ = ssh.exec(&format!("./{remote_path} stop")).await;
    }

    if !should_deploy {
        match ssh.exec(&format!("./{remote_path} version")).await {
            Ok((stdout, _, Some(0))) if stdout.trim().contains(PROTOCOL_VERSION) => {
                info!(path = %remote_path, "remote agent up to date");
            }
            _ => should_deploy = true,
        }
    }

    if should_deploy {
        info!(version = PROTOCOL_VERSION, path = %remote_path, "deploying mpf to remote");

        let remote_arch = match ssh.exec("uname -m").await {
            Ok((stdout, _, Some(0))) => stdout.trim().to_string(),
            _ => {
                warn!("could not determine remote architecture, attempting upload");
                String::new()
            }
        };

        if remote_arch.is_empty() || (cfg!(target_os = "linux") && arch_matches(&remote_arch)) {
            upload_binary(ssh, &remote_path).await?;
        } else {
            info!(
                remote_arch = %remote_arch,
                "architecture or OS mismatch, falling back to release download"
            );
            download_binary(ssh, &remote_path, &remote_arch).await?;
        }
    }

    Ok(remote_path)
}

/// Whether the remote `uname -m` output matches the local build target.
fn arch_matches(remote_arch: &str) -> bool {
    match remote_arch {
        "x86_64" => cfg!(target_arch = "x86_64"),
        "aarch64" => cfg!(target_arch = "aarch64"),
        "armv7l" | "armv6l" => cfg!(target_arch = "arm"),
        "i386" | "i686" => cfg!(target_arch = "x86"),
        _ => false,
    }
}

/// Map `uname -m` output to the architecture tag in release file names.
fn release_arch(remote_arch: &str) -> &str {
    match remote_arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "armv7l" | "armv6l" => "arm",
        "i386" | "i686" => "386",
        other => other,
    }
}

/// Stream the local executable to the remote path.
async fn upload_binary(ssh: &SshSession, remote_path: &str) -> Result<()> {
    let local = std::env::current_exe()
        .map_err(|e| Error::Ssh(format!("cannot locate own executable: {e}")))?;
    let data = std::fs::read(&local)
        .map_err(|e| Error::Ssh(format!("cannot read own executable: {e}")))?;

    info!(bytes = data.len(), path = %remote_path, "uploading agent binary");

    let command = format!(
        "mkdir -p \"$(dirname {remote_path})\" && cat > {remote_path}.tmp \
         && chmod 755 {remote_path}.tmp && mv {remote_path}.tmp {remote_path}"
    );
    match ssh.exec_with_stdin(&command, &data).await? {
        Some(0) | None => Ok(()),
        Some(code) => Err(Error::Ssh(format!("upload command exited with {code}"))),
    }
}

/// Have the remote download and unpack the release archive for its own
/// architecture.
async fn download_binary(ssh: &SshSession, remote_path: &str, remote_arch: &str) -> Result<()> {
    let arch = release_arch(remote_arch);
    let url = format!(
        "{RELEASE_REPO}/releases/download/v{PROTOCOL_VERSION}/mpf-v{PROTOCOL_VERSION}-linux-{arch}.tar.gz"
    );

    info!(%url, "downloading release on remote");

    let command = format!(
        "set -e; dir=\"$(dirname {remote_path})\"; mkdir -p \"$dir\"; \
         if command -v curl >/dev/null 2>&1; then curl -fsSL \"{url}\" -o \"$dir/mpf.tar.gz\"; \
         else wget -qO \"$dir/mpf.tar.gz\" \"{url}\"; fi; \
         tar xzf \"$dir/mpf.tar.gz\" -C \"$dir\"; rm -f \"$dir/mpf.tar.gz\"; \
         chmod 755 {remote_path}"
    );
    match ssh.exec(&format!("sh -c '{command}'")).await? {
        (_, _, Some(0)) => Ok(()),
        (_, stderr, code) => Err(Error::Ssh(format!(
            "release download failed (exit {code:?}): {}",
            stderr.trim()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_arch_mapping() {
        assert_eq!(release_arch("x86_64"), "amd64");
        assert_eq!(release_arch("aarch64"), "arm64");
        assert_eq!(release_arch("armv7l"), "arm");
        assert_eq!(release_arch("i686"), "386");
        assert_eq!(release_arch("riscv64"), "riscv64");
    }

    #[test]
    fn arch_matches_only_own_target() {
        #[cfg(target_arch = "x86_64")]
        {
            assert!(arch_matches("x86_64"));
            assert!(!arch_matches("aarch64"));
        }
        #[cfg(target_arch = "aarch64")]
        {
            assert!(arch_matches("aarch64"));
            assert!(!arch_matches("x86_64"));
        }
        assert!(!arch_matches("mystery-cpu"));
    }
}
