//! Master-side forwarder: TCP listeners whose accepted connections are
//! proxied over tunnel streams to the slave.
//!
//! One listener per `master_port`. Each accepted connection opens a fresh
//! stream on the best live session, sends the dial target as a
//! [`StreamHeader`], waits for the slave's one-byte dial status, then
//! splices bytes both ways until either side closes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use common::{Error, Result};
use protocol::{ForwardEntry, StreamHeader, STREAM_ACK};
use tunnel::SessionManager;

/// How a bare `":port"` binding is widened to a full socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BindPolicy {
    /// Bind `127.0.0.1:port`; forwards reachable from this machine only.
    Loopback,
    /// Bind `0.0.0.0:port`; forwards reachable from the network.
    Any,
}

impl std::fmt::Display for BindPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loopback => write!(f, "loopback"),
            Self::Any => write!(f, "any"),
        }
    }
}

struct ListenerHandle {
    /// Distinguishes this listener from a later rebind of the same port,
    /// so a stale accept loop's cleanup cannot remove its successor.
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    listeners: HashMap<u16, ListenerHandle>,
    forwards: HashMap<u16, ForwardEntry>,
    next_generation: u64,
}

/// Owns the master's forward table. Held behind an `Arc`; the lock guards
/// only map mutations, never I/O.
pub struct Forwarder {
    remote_name: String,
    master_ip: String,
    target: String,
    bind_policy: BindPolicy,
    sessions: Arc<SessionManager>,
    state: Option<Arc<state::Manager>>,
    inner: Mutex<Inner>,
}

impl Forwarder {
    pub fn new(
        sessions: Arc<SessionManager>,
        remote_name: impl Into<String>,
        target: impl Into<String>,
        state: Option<Arc<state::Manager>>,
        bind_policy: BindPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote_name: remote_name.into(),
            master_ip: protocol::local_ip(),
            target: target.into(),
            bind_policy,
            sessions,
            state,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn master_ip(&self) -> &str {
        &self.master_ip
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    /// Open a TCP listener and forward every accepted connection to
    /// `remote_host:remote_port` on the slave side. Returns the actually
    /// bound master port (`local_addr` may name port 0).
    pub async fn listen_and_forward(
        self: &Arc<Self>,
        local_addr: &str,
        remote_host: &str,
        remote_port: u16,
        is_auto: bool,
    ) -> Result<u16> {
        let bind_addr = self.normalize_bind_addr(local_addr);
        let requested: SocketAddr = bind_addr
            .parse()
            .map_err(|e| Error::Forward(format!("invalid bind address '{bind_addr}': {e}")))?;
        let requested_port = requested.port();

        let mut entry = ForwardEntry {
            local_addr: bind_addr.clone(),
            remote_host: remote_host.to_string(),
            remote_port,
            is_auto,
            error: String::new(),
            transport: String::new(),
        };

        // At most one live listener per master port.
        if requested_port != 0 {
            let inner = self.inner.lock().expect("forwarder lock poisoned");
            if inner.listeners.contains_key(&requested_port) {
                return Err(Error::Forward(format!(
                    "port {requested_port} is already forwarded"
                )));
            }
        }

        let listener = match TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                entry.error = e.to_string();
                self.inner
                    .lock()
                    .expect("forwarder lock poisoned")
                    .forwards
                    .insert(requested_port, entry);
                return Err(Error::Forward(format!("bind {bind_addr} failed: {e}")));
            }
        };

        let master_port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(requested_port);

        if let Some(state) = &self.state {
            if let Err(e) = state.add_forward(&self.target, remote_port, master_port) {
                warn!(%e, master_port, "failed to persist forward");
            }
        }

        {
            let mut inner = self.inner.lock().expect("forwarder lock poisoned");
            inner.next_generation += 1;
            let generation = inner.next_generation;
            inner.forwards.insert(master_port, entry);

            let task = tokio::spawn(accept_loop(
                self.clone(),
                listener,
                generation,
                master_port,
                remote_host.to_string(),
                remote_port,
            ));
            inner
                .listeners
                .insert(master_port, ListenerHandle { generation, task });
        }

        let display_host = if remote_host == "localhost" || remote_host == "127.0.0.1" {
            self.remote_name.as_str()
        } else {
            remote_host
        };
        info!(
            local = %bind_addr,
            remote = %format!("{display_host}:{remote_port}"),
            is_auto,
            "forwarding started"
        );

        Ok(master_port)
    }

    /// Stop the listener on `master_port`. Returns `true` iff a live
    /// listener was closed; a failed (listenerless) entry is still purged.
    pub fn close_forward(&self, master_port: u16) -> bool {
        let mut inner = self.inner.lock().expect("forwarder lock poisoned");

        match inner.listeners.remove(&master_port) {
            Some(handle) => {
                handle.task.abort();
                inner.forwards.remove(&master_port);
                drop(inner);
                self.forget_persisted(master_port);
                info!(remote = %self.remote_name, port = master_port, "forwarding stopped");
                true
            }
            None => {
                let had_entry = inner.forwards.remove(&master_port).is_some();
                drop(inner);
                if had_entry {
                    self.forget_persisted(master_port);
                }
                false
            }
        }
    }

    /// Snapshot of the forward table, each entry labelled with the current
    /// best transport (or `NONE` when no session is live).
    pub fn get_forward_entries(&self) -> Vec<ForwardEntry> {
        let transport = match self.sessions.get_best() {
            Some(session) => session.kind().label().to_string(),
            None => "NONE".to_string(),
        };

        let inner = self.inner.lock().expect("forwarder lock poisoned");
        let mut entries: Vec<ForwardEntry> = inner
            .forwards
            .values()
            .map(|entry| {
                let mut entry = entry.clone();
                entry.transport = transport.clone();
                entry
            })
            .collect();
        entries.sort_by_key(|entry| entry.remote_port);
        entries
    }

    /// Whether a live listener exists for `master_port`.
    pub fn has_listener(&self, master_port: u16) -> bool {
        self.inner
            .lock()
            .expect("forwarder lock poisoned")
            .listeners
            .contains_key(&master_port)
    }

    /// Re-establish persisted forwards for this target that are not already
    /// listening. Runs before the first session is live (and again on every
    /// reconnection); forwarding only needs a session once a connection
    /// actually arrives.
    pub async fn restore(self: &Arc<Self>) {
        let Some(state) = &self.state else { return };
        for (master_port, slave_port) in state.forwards(&self.target) {
            if self.has_listener(master_port) {
                continue;
            }
            if let Err(e) = self
                .listen_and_forward(&format!(":{master_port}"), "localhost", slave_port, false)
                .await
            {
                warn!(master_port, slave_port, %e, "failed to restore forward");
            }
        }
    }

    /// Close every listener and clear the table (process shutdown).
    pub fn close_all(&self) {
        let mut inner = self.inner.lock().expect("forwarder lock poisoned");
        for (_, handle) in inner.listeners.drain() {
            handle.task.abort();
        }
        inner.forwards.clear();
    }

    fn normalize_bind_addr(&self, local_addr: &str) -> String {
        match local_addr.strip_prefix(':') {
            Some(port) => match self.bind_policy {
                BindPolicy::Loopback => format!("127.0.0.1:{port}"),
                BindPolicy::Any => format!("0.0.0.0:{port}"),
            },
            None => local_addr.to_string(),
        }
    }

    fn forget_persisted(&self, master_port: u16) {
        if let Some(state) = &self.state {
            if let Err(e) = state.remove_forward(&self.target, master_port) {
                warn!(%e, master_port, "failed to remove persisted forward");
            }
        }
    }
}

async fn accept_loop(
    forwarder: Arc<Forwarder>,
    listener: TcpListener,
    generation: u64,
    master_port: u16,
    remote_host: String,
    remote_port: u16,
) {
    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(port = master_port, %e, "accept error, listener exiting");
                break;
            }
        };
        let _ = conn.set_nodelay(true);
        debug!(port = master_port, %peer, "accepted local connection");
        tokio::spawn(handle_connection(
            forwarder.clone(),
            conn,
            remote_host.clone(),
            remote_port,
        ));
    }

    // Only clean up if this listener is still the registered one; a
    // close-then-rebind may have replaced it.
    let mut inner = forwarder.inner.lock().expect("forwarder lock poisoned");
    let still_current = inner
        .listeners
        .get(&master_port)
        .is_some_and(|handle| handle.generation == generation);
    if still_current {
        inner.listeners.remove(&master_port);
        inner.forwards.remove(&master_port);
    }
}

/// Proxy one accepted connection over a fresh tunnel stream.
async fn handle_connection(
    forwarder: Arc<Forwarder>,
    mut conn: TcpStream,
    remote_host: String,
    remote_port: u16,
) {
    let Some(session) = forwarder.sessions.get_best() else {
        error!("no active session for forwarding");
        return;
    };

    let mut stream = match session.multiplexer().open_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            error!(%e, "failed to open tunnel stream");
            return;
        }
    };

    let header = StreamHeader {
        host: remote_host,
        port: remote_port,
    };
    if let Err(e) = protocol::write_frame(&mut stream, &header).await {
        error!(%e, "failed to send stream header");
        return;
    }

    let mut status = [0u8; 1];
    match stream.read_exact(&mut status).await {
        Ok(_) if status[0] == STREAM_ACK => {}
        Ok(_) => {
            warn!(
                host = %header.host,
                port = header.port,
                "slave could not dial target"
            );
            return;
        }
        Err(e) => {
            error!(%e, "failed to read dial status");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut conn, &mut stream).await {
        Ok((to_remote, to_local)) => {
            debug!(to_remote, to_local, "forward stream finished");
        }
        Err(e) => {
            debug!(%e, "forward stream ended with error");
        }
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<SessionManager> {
        Arc::new(SessionManager::new())
    }

    fn forwarder(state: Option<Arc<state::Manager>>) -> Arc<Forwarder> {
        Forwarder::new(manager(), "remote", "user@remote", state, BindPolicy::Loopback)
    }

    #[tokio::test]
    async fn bind_on_port_zero_reports_real_port() {
        let fwd = forwarder(None);
        let port = fwd
            .listen_and_forward(":0", "localhost", 8080, false)
            .await
            .expect("listen failed");
        assert_ne!(port, 0);

        let entries = fwd.get_forward_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].remote_port, 8080);
        assert!(entries[0].error.is_empty());
        assert_eq!(entries[0].transport, "NONE");
    }

    #[tokio::test]
    async fn duplicate_port_is_refused() {
        let fwd = forwarder(None);
        let port = fwd
            .listen_and_forward(":0", "localhost", 80, false)
            .await
            .expect("listen failed");

        let err = fwd
            .listen_and_forward(&format!(":{port}"), "localhost", 81, false)
            .await
            .expect_err("duplicate bind must fail");
        assert!(err.to_string().contains("already forwarded"));

        // The original forward is untouched.
        assert_eq!(fwd.get_forward_entries().len(), 1);
        assert_eq!(fwd.get_forward_entries()[0].remote_port, 80);
    }

    #[tokio::test]
    async fn failed_bind_is_recorded_without_listener() {
        // Occupy a port outside the forwarder, then ask it to bind there.
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = blocker.local_addr().unwrap().port();

        let fwd = forwarder(None);
        let err = fwd
            .listen_and_forward(&format!(":{port}"), "localhost", 9999, false)
            .await
            .expect_err("bind must fail");
        assert!(err.to_string().contains("bind"));

        let entries = fwd.get_forward_entries();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].error.is_empty());

        // No live listener, so closing reports false but purges the entry.
        assert!(!fwd.close_forward(port));
        assert!(fwd.get_forward_entries().is_empty());
    }

    #[tokio::test]
    async fn close_forward_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let state =
            Arc::new(state::Manager::with_path(dir.path().join("forwards.json")).unwrap());
        let fwd = forwarder(Some(state.clone()));

        let port = fwd
            .listen_and_forward(":0", "localhost", 7070, false)
            .await
            .expect("listen failed");
        assert_eq!(state.forwards("user@remote"), vec![(port, 7070)]);

        assert!(fwd.close_forward(port));
        assert!(fwd.get_forward_entries().is_empty());
        assert!(state.forwards("user@remote").is_empty());

        // Closing again is a no-op.
        assert!(!fwd.close_forward(port));

        // The port is free for a rebind.
        let rebound = fwd
            .listen_and_forward(&format!(":{port}"), "localhost", 7070, false)
            .await
            .expect("rebind failed");
        assert_eq!(rebound, port);
    }

    #[tokio::test]
    async fn restore_replays_persisted_forwards() {
        let dir = tempfile::tempdir().unwrap();
        let state =
            Arc::new(state::Manager::with_path(dir.path().join("forwards.json")).unwrap());

        // Persist through a throwaway forwarder on an ephemeral port.
        let port = {
            let fwd = forwarder(Some(state.clone()));
            let port = fwd
                .listen_and_forward(":0", "localhost", 4242, false)
                .await
                .expect("listen failed");
            // close_all drops listeners but keeps persisted state.
            fwd.close_all();
            port
        };
        assert_eq!(state.forwards("user@remote"), vec![(port, 4242)]);

        let fwd = forwarder(Some(state.clone()));
        fwd.restore().await;

        let entries = fwd.get_forward_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].remote_port, 4242);
        assert_eq!(entries[0].local_addr, format!("127.0.0.1:{port}"));
    }

    #[tokio::test]
    async fn bind_policy_widens_bare_ports() {
        let fwd = Forwarder::new(manager(), "remote", "user@remote", None, BindPolicy::Any);
        assert_eq!(fwd.normalize_bind_addr(":8080"), "0.0.0.0:8080");

        let fwd = forwarder(None);
        assert_eq!(fwd.normalize_bind_addr(":8080"), "127.0.0.1:8080");
        // Fully specified addresses pass through untouched.
        assert_eq!(fwd.normalize_bind_addr("10.0.0.1:80"), "10.0.0.1:80");
    }
}
