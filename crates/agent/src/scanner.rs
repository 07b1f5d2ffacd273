//! Discovery of locally listening TCP services, with owning-process info.
//!
//! On Linux this parses `/proc/net/tcp` and `/proc/net/tcp6` for sockets in
//! the LISTEN state, maps socket inodes to pids by walking `/proc/<pid>/fd`,
//! and resolves each owner's command line and executable path. Other
//! platforms get a stub that warns once and reports nothing; the agent is
//! deployed to Linux hosts.

use std::collections::HashSet;
use std::path::PathBuf;

/// One listening TCP socket and what owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListeningPort {
    pub port: u16,
    /// Owning pid, when the socket inode could be traced to a process.
    pub pid: Option<u32>,
    /// Owner's command line, empty when unknown.
    pub cmdline: String,
    /// Owner's resolved executable path.
    pub exe: Option<PathBuf>,
}

/// Enumerate listening TCP ports.
pub trait PortScanner: Send + Sync + 'static {
    fn scan(&self) -> std::io::Result<Vec<ListeningPort>>;
}

#[cfg(target_os = "linux")]
mod platform {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;

    use tracing::{debug, trace};

    /// TCP socket state for LISTEN.
    const TCP_LISTEN_STATE: u8 = 0x0A;

    /// Scanner over `/proc`. The root can be overridden for tests.
    pub struct ProcScanner {
        proc_root: PathBuf,
    }

    impl ProcScanner {
        pub fn new() -> Self {
            Self {
                proc_root: PathBuf::from("/proc"),
            }
        }

        pub fn with_root(proc_root: PathBuf) -> Self {
            Self { proc_root }
        }
    }

    impl Default for ProcScanner {
        fn default() -> Self {
            Self::new()
        }
    }

    impl PortScanner for ProcScanner {
        fn scan(&self) -> std::io::Result<Vec<ListeningPort>> {
            let inode_to_pid = build_inode_map(&self.proc_root);

            let mut seen = HashSet::new();
            let mut out = Vec::new();

            for filename in ["tcp", "tcp6"] {
                let path = self.proc_root.join("net").join(filename);
                let contents = match fs::read_to_string(&path) {
                    Ok(contents) => contents,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        debug!(?path, "proc net file not found, skipping");
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                for (port, inode) in parse_listen_entries(&contents) {
                    if !seen.insert(port) {
                        continue;
                    }
                    let pid = inode_to_pid.get(&inode).copied();
                    let (cmdline, exe) = match pid {
                        Some(pid) => process_info(&self.proc_root, pid),
                        None => (String::new(), None),
                    };
                    trace!(port, ?pid, "found listening socket");
                    out.push(ListeningPort {
                        port,
                        pid,
                        cmdline,
                        exe,
                    });
                }
            }

            Ok(out)
        }
    }

    /// Extract `(port, inode)` of every LISTEN socket from a
    /// `/proc/net/tcp{,6}` file.
    ///
    /// Fields (whitespace-delimited): `[1]` local `hexaddr:hexport`,
    /// `[3]` state (hex), `[9]` inode.
    pub(super) fn parse_listen_entries(contents: &str) -> Vec<(u16, u64)> {
        let mut entries = Vec::new();
        for line in contents.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                continue;
            }

            let state = fields
                .get(3)
                .and_then(|s| u8::from_str_radix(s, 16).ok());
            if state != Some(TCP_LISTEN_STATE) {
                continue;
            }

            let port = fields
                .get(1)
                .and_then(|local| local.rsplit(':').next())
                .and_then(|hex| u16::from_str_radix(hex, 16).ok());
            let inode = fields.get(9).and_then(|s| s.parse::<u64>().ok());

            if let (Some(port), Some(inode)) = (port, inode) {
                entries.push((port, inode));
            }
        }
        entries
    }

    /// Map socket inodes to pids by walking `/proc/<pid>/fd/`.
    fn build_inode_map(proc_root: &Path) -> HashMap<u64, u32> {
        let mut map = HashMap::new();

        let Ok(proc_dir) = fs::read_dir(proc_root) else {
            return map;
        };

        for entry in proc_dir.flatten() {
            let name = entry.file_name();
            let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
                continue;
            };

            let Ok(fd_entries) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };

            for fd_entry in fd_entries.flatten() {
                let Ok(link) = fs::read_link(fd_entry.path()) else {
                    continue;
                };
                let link = link.to_string_lossy();
                if let Some(inode) = link
                    .strip_prefix("socket:[")
                    .and_then(|s| s.strip_suffix(']'))
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    map.insert(inode, pid);
                }
            }
        }

        map
    }

    /// Command line (NUL bytes turned into spaces) and resolved executable
    /// of a pid. Either may be unavailable for short-lived processes.
    fn process_info(proc_root: &Path, pid: u32) -> (String, Option<PathBuf>) {
        let pid_dir = proc_root.join(pid.to_string());

        let cmdline = fs::read(pid_dir.join("cmdline"))
            .map(|raw| {
                String::from_utf8_lossy(&raw)
                    .split('\0')
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();

        let exe = fs::read_link(pid_dir.join("exe"))
            .ok()
            .map(|p| p.canonicalize().unwrap_or(p));

        (cmdline, exe)
    }

    pub use ProcScanner as DefaultScanner;
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tracing::warn;

    /// Stub scanner for non-Linux platforms.
    #[derive(Default)]
    pub struct StubScanner {
        warned: AtomicBool,
    }

    impl StubScanner {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl PortScanner for StubScanner {
        fn scan(&self) -> std::io::Result<Vec<ListeningPort>> {
            if !self.warned.swap(true, Ordering::Relaxed) {
                warn!("port scanning is not supported on this platform");
            }
            Ok(Vec::new())
        }
    }

    pub use StubScanner as DefaultScanner;
}

pub use platform::DefaultScanner;
