//! Auto-forwarder: mirrors newly listening slave-side services to the
//! master without user interaction.
//!
//! Every scan interval the set of listening TCP ports is diffed against the
//! forwards this module has already requested. New candidate ports produce
//! a `ListenRequest{is_auto}`; vanished ones a `CloseRequest`. Scan or send
//! failures are logged and retried on the next tick; the scanner never
//! dies.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use protocol::ControlMsg;

use crate::scanner::{DefaultScanner, ListeningPort, PortScanner};
use crate::Agent;

/// Period between port scans.
pub const SCAN_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Services whose command line contains any of these are never mirrored:
/// the terminal stack itself, remote-shell daemons, container proxies, and
/// the agent binary.
pub const EXCLUDED_SUBSTRINGS: &[&str] = &[
    "vscode",
    "code-server",
    "extensionhost",
    "ssh",
    "sshd",
    "docker-proxy",
    "containerd",
    "mpf",
    "mosh",
];

pub struct AutoForwarder {
    agent: Arc<Agent>,
    scanner: Box<dyn PortScanner>,
    active: Mutex<HashSet<u16>>,
    current_exe: Option<PathBuf>,
}

impl AutoForwarder {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self::with_scanner(agent, Box::new(DefaultScanner::new()))
    }

    pub fn with_scanner(agent: Arc<Agent>, scanner: Box<dyn PortScanner>) -> Self {
        let current_exe = std::env::current_exe()
            .ok()
            .and_then(|p| p.canonicalize().ok());
        Self {
            agent,
            scanner,
            active: Mutex::new(HashSet::new()),
            current_exe,
        }
    }

    /// Scan forever. Runs as its own task for the agent's lifetime.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(SCAN_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.scan_once().await;
        }
    }

    /// One scan-and-diff round.
    pub async fn scan_once(&self) {
        let listeners = match self.scanner.scan() {
            Ok(listeners) => listeners,
            Err(e) => {
                error!(%e, "failed to list listening ports");
                return;
            }
        };

        let found: HashSet<u16> = listeners
            .iter()
            .filter(|listener| self.is_candidate(listener))
            .map(|listener| listener.port)
            .collect();

        let (added, removed) = {
            let active = self.active.lock().await;
            let added: Vec<u16> = found.difference(&active).copied().collect();
            let removed: Vec<u16> = active.difference(&found).copied().collect();
            (added, removed)
        };

        for port in added {
            self.start_forward(port).await;
        }
        for port in removed {
            self.stop_forward(port).await;
        }
    }

    /// Whether a listening socket qualifies for mirroring.
    fn is_candidate(&self, listener: &ListeningPort) -> bool {
        if listener.port < 1024 {
            return false;
        }
        let Some(_pid) = listener.pid else {
            return false;
        };

        let cmdline = listener.cmdline.to_lowercase();
        if EXCLUDED_SUBSTRINGS
            .iter()
            .any(|excluded| cmdline.contains(excluded))
        {
            return false;
        }

        // Never mirror the agent's own sockets.
        if let (Some(exe), Some(current)) = (&listener.exe, &self.current_exe) {
            let resolved = exe.canonicalize().unwrap_or_else(|_| exe.clone());
            if &resolved == current {
                return false;
            }
        }

        true
    }

    async fn start_forward(&self, port: u16) {
        let Some(session) = self.agent.best_session() else {
            debug!(port, "no session for auto-forward, will retry");
            return;
        };

        info!(port, "auto-forwarding new port");
        let request = ControlMsg::ListenRequest {
            local_addr: format!(":{port}"),
            remote_host: "localhost".into(),
            remote_port: port,
            is_auto: true,
        };
        match session.send(&request).await {
            Ok(()) => {
                self.active.lock().await.insert(port);
            }
            Err(e) => {
                error!(port, %e, "failed to request auto-forward");
            }
        }
    }

    async fn stop_forward(&self, port: u16) {
        let Some(session) = self.agent.best_session() else {
            return;
        };

        info!(port, "stopping auto-forward for closed port");
        match session.send(&ControlMsg::CloseRequest { port }).await {
            Ok(()) => {
                self.active.lock().await.remove(&port);
            }
            Err(e) => {
                error!(port, %e, "failed to request auto-forward close");
            }
        }
    }
}
