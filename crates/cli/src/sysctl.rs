//! UDP buffer preflight for the secondary transport.
//!
//! QUIC throughput suffers badly when the kernel's UDP buffer ceilings are
//! at their conservative defaults. Before starting a session the master
//! checks both ends and gives the user a chance to fix the sysctls (or
//! shrug and continue).

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::ssh::SshSession;

/// Recommended minimum for net.core.rmem_max / wmem_max.
pub const RECOMMENDED_UDP_BUFFER: u64 = 2_500_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpBufferInfo {
    pub rmem_max: u64,
    pub wmem_max: u64,
}

/// Local kernel UDP buffer ceilings (Linux only).
pub fn local_udp_buffer_info() -> Option<UdpBufferInfo> {
    if !cfg!(target_os = "linux") {
        return None;
    }
    let read = |path: &str| -> Option<u64> {
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    };
    Some(UdpBufferInfo {
        rmem_max: read("/proc/sys/net/core/rmem_max")?,
        wmem_max: read("/proc/sys/net/core/wmem_max")?,
    })
}

/// Remote kernel UDP buffer ceilings, read over SSH.
pub async fn remote_udp_buffer_info(ssh: &SshSession) -> Option<UdpBufferInfo> {
    let (stdout, _, code) = ssh
        .exec("cat /proc/sys/net/core/rmem_max /proc/sys/net/core/wmem_max")
        .await
        .ok()?;
    if code != Some(0) {
        debug!("remote UDP buffer query failed");
        return None;
    }
    let mut values = stdout.split_whitespace().filter_map(|v| v.parse().ok());
    Some(UdpBufferInfo {
        rmem_max: values.next()?,
        wmem_max: values.next()?,
    })
}

/// A human-readable warning when the ceilings are below the
/// recommendation, or `None` when they are fine.
pub fn buffer_warning(side: &str, info: UdpBufferInfo) -> Option<String> {
    if info.rmem_max >= RECOMMENDED_UDP_BUFFER && info.wmem_max >= RECOMMENDED_UDP_BUFFER {
        return None;
    }
    Some(format!(
        "Warning: {side} UDP buffer limits are low (rmem_max={}, wmem_max={}).\n\
         The QUIC transport may be slow. Consider:\n\
         \x20 sysctl -w net.core.rmem_max={RECOMMENDED_UDP_BUFFER} net.core.wmem_max={RECOMMENDED_UDP_BUFFER}\n",
        info.rmem_max, info.wmem_max,
    ))
}

/// Print a warning and wait for the user to confirm (Enter) or interrupt.
/// Non-interactive stdin continues immediately.
pub async fn confirm_or_continue(warning: &str) {
    print!("{warning}");
    println!("Press Enter to continue anyway (Ctrl-C to abort)...");

    if !stdin_is_tty() {
        return;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let _ = lines.next_line().await;
}

#[cfg(unix)]
fn stdin_is_tty() -> bool {
    unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
}

#[cfg(not(unix))]
fn stdin_is_tty() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ample_buffers_produce_no_warning() {
        let info = UdpBufferInfo {
            rmem_max: RECOMMENDED_UDP_BUFFER,
            wmem_max: RECOMMENDED_UDP_BUFFER * 2,
        };
        assert!(buffer_warning("local", info).is_none());
    }

    #[test]
    fn low_buffers_warn_with_sysctl_hint() {
        let info = UdpBufferInfo {
            rmem_max: 212_992,
            wmem_max: 212_992,
        };
        let warning = buffer_warning("remote", info).expect("expected warning");
        assert!(warning.contains("remote"));
        assert!(warning.contains("rmem_max=212992"));
        assert!(warning.contains("sysctl -w"));
    }

    #[test]
    fn one_low_ceiling_is_enough_to_warn() {
        let info = UdpBufferInfo {
            rmem_max: RECOMMENDED_UDP_BUFFER,
            wmem_max: 1,
        };
        assert!(buffer_warning("local", info).is_some());
    }
}
