//! The slave agent.
//!
//! Started on the remote host as `mpf agent` with stdio wired to the
//! master's SSH exec channel. Builds the primary session over stdio, runs
//! the version handshake, offers the QUIC listener, and then serves three
//! loops per session: control messages, incoming tunnel streams, and the
//! heartbeat (owned by the session manager). A unix socket bridges the
//! single-shot CLI to the control plane.

pub mod acceptor;
pub mod auto_forward;
pub mod control_socket;
pub mod scanner;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use common::{Error, Result};
use protocol::{ControlMsg, PROTOCOL_VERSION};
use tunnel::{quic, tls, Session, SessionManager};

/// Capacity of each per-kind response channel.
const RESPONSE_CHANNEL_CAPACITY: usize = 10;

/// Idle shutdown delay once the last session is gone.
const SHUTDOWN_DELAY: std::time::Duration = std::time::Duration::from_secs(600);

/// Idle shutdown delay in dev mode.
const SHUTDOWN_DELAY_DEV: std::time::Duration = std::time::Duration::from_secs(5);

/// Shared agent state: the session set plus the per-kind response channels
/// that route master replies back to waiting CLI connections.
pub struct Agent {
    sessions: Arc<SessionManager>,
    list_tx: mpsc::Sender<ControlMsg>,
    list_rx: tokio::sync::Mutex<mpsc::Receiver<ControlMsg>>,
    listen_tx: mpsc::Sender<ControlMsg>,
    listen_rx: tokio::sync::Mutex<mpsc::Receiver<ControlMsg>>,
    close_tx: mpsc::Sender<ControlMsg>,
    close_rx: tokio::sync::Mutex<mpsc::Receiver<ControlMsg>>,
    shutdown_timer: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Default for Agent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent {
    pub fn new() -> Self {
        let (list_tx, list_rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let (listen_tx, listen_rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let (close_tx, close_rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        Self {
            sessions: Arc::new(SessionManager::new()),
            list_tx,
            list_rx: tokio::sync::Mutex::new(list_rx),
            listen_tx,
            listen_rx: tokio::sync::Mutex::new(listen_rx),
            close_tx,
            close_rx: tokio::sync::Mutex::new(close_rx),
            shutdown_timer: std::sync::Mutex::new(None),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn best_session(&self) -> Option<Arc<Session>> {
        self.sessions.get_best()
    }

    /// Register a session: cancel any pending shutdown, start its stream
    /// acceptor and control loop, arm the idle timer when it goes away.
    pub fn add_session(self: &Arc<Self>, session: Arc<Session>) {
        self.cancel_shutdown_timer();

        let on_remove = {
            let agent = self.clone();
            Box::new(move || {
                if agent.sessions.count() == 0 {
                    agent.arm_shutdown_timer();
                }
            })
        };
        self.sessions.add(session.clone(), Some(on_remove));

        tokio::spawn(acceptor::run(session.clone()));

        let agent = self.clone();
        tokio::spawn(async move {
            loop {
                match session.receive().await {
                    Ok(msg) => agent.handle_message(&session, msg).await,
                    Err(e) => {
                        debug!(session = session.id(), %e, "control stream ended");
                        agent.sessions.remove(&session);
                        return;
                    }
                }
            }
        });
    }

    async fn handle_message(&self, session: &Arc<Session>, msg: ControlMsg) {
        match msg {
            ControlMsg::Heartbeat => {
                let _ = session.send(&ControlMsg::HeartbeatAck).await;
            }
            ControlMsg::HeartbeatAck => {}
            ControlMsg::Shutdown { reason } => {
                info!(%reason, "shutdown received, agent exiting");
                std::process::exit(0);
            }
            ControlMsg::ListRequest => {
                // The slave owns no listeners today; the reply exists for
                // symmetry with future reverse forwarding.
                let _ = session
                    .send(&ControlMsg::ListResponse {
                        entries: Vec::new(),
                        master_ip: protocol::local_ip(),
                    })
                    .await;
            }
            msg @ ControlMsg::ListResponse { .. } => {
                if self.list_tx.try_send(msg).is_err() {
                    warn!("ListResponse dropped - no receiver");
                }
            }
            ControlMsg::ListenResponse {
                remote_port,
                success,
                reason,
            } => {
                if success {
                    info!(port = remote_port, "forwarding confirmed by master");
                } else {
                    error!(port = remote_port, %reason, "forwarding failed on master");
                }
                let msg = ControlMsg::ListenResponse {
                    remote_port,
                    success,
                    reason,
                };
                if self.listen_tx.try_send(msg).is_err() {
                    warn!("ListenResponse dropped - no receiver");
                }
            }
            msg @ ControlMsg::CloseResponse { .. } => {
                if self.close_tx.try_send(msg).is_err() {
                    warn!("CloseResponse dropped - no receiver");
                }
            }
            ControlMsg::ListenRequest { .. } => {
                // Reserved: reverse (master -> slave) forwarding.
                warn!("ListenRequest received from master, not implemented");
            }
            other => {
                debug!(?other, "unhandled control message");
            }
        }
    }

    fn arm_shutdown_timer(self: &Arc<Self>) {
        let delay = if common::is_dev() {
            SHUTDOWN_DELAY_DEV
        } else {
            SHUTDOWN_DELAY
        };

        let mut guard = self.shutdown_timer.lock().expect("timer lock poisoned");
        if let Some(old) = guard.take() {
            old.abort();
        }
        info!(?delay, "no active sessions left, starting shutdown timer");

        let agent = self.clone();
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if agent.sessions.count() == 0 {
                info!("shutdown timer expired, agent exiting");
                std::process::exit(0);
            }
        }));
    }

    fn cancel_shutdown_timer(&self) {
        let mut guard = self.shutdown_timer.lock().expect("timer lock poisoned");
        if let Some(timer) = guard.take() {
            timer.abort();
            info!("new session connected, canceling shutdown timer");
        }
    }

    #[cfg(test)]
    fn shutdown_timer_armed(&self) -> bool {
        self.shutdown_timer
            .lock()
            .expect("timer lock poisoned")
            .is_some()
    }
}

/// Slave side of the version handshake: expect `Hello`, answer `HelloAck`
/// with the secondary-transport offer. A mismatched version gets a
/// `Shutdown` reply and fails the session. Returns the master's
/// auto-forward request.
async fn perform_handshake(session: &Session, udp_port: u16, tls_hash: String) -> Result<bool> {
    let (version, auto_forward) = match session.receive().await? {
        ControlMsg::Hello {
            version,
            auto_forward,
        } => (version, auto_forward),
        other => {
            return Err(Error::Handshake(format!("expected Hello, got {other:?}")));
        }
    };

    if version != PROTOCOL_VERSION {
        let _ = session
            .send(&ControlMsg::Shutdown {
                reason: "Version mismatch".into(),
            })
            .await;
        return Err(Error::Handshake(format!(
            "version mismatch: {version} != {PROTOCOL_VERSION}"
        )));
    }

    session
        .send(&ControlMsg::HelloAck {
            version: PROTOCOL_VERSION.into(),
            udp_port,
            tls_hash,
        })
        .await?;

    Ok(auto_forward)
}

/// Agent entry point: handshake on stdio, then serve until told to stop.
pub async fn run() -> Result<()> {
    info!(version = PROTOCOL_VERSION, "agent starting");

    // The QUIC offer is best-effort: with no bindable port the agent still
    // serves over the primary transport.
    let quic_offer = match tls::generate_ephemeral_cert() {
        Ok(cert) => match quic::bind_listener(&cert) {
            Ok((endpoint, port)) => Some((endpoint, port, cert.fingerprint)),
            Err(e) => {
                warn!(%e, "QUIC listener unavailable, primary transport only");
                None
            }
        },
        Err(e) => {
            warn!(%e, "certificate generation failed, primary transport only");
            None
        }
    };

    // stdin/stdout belong to the tunnel from here on.
    let stdio = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
    let session = Session::new_pipe(stdio, true).await?;

    let (udp_port, tls_hash) = match &quic_offer {
        Some((_, port, fingerprint)) => (*port, fingerprint.clone()),
        None => (0, String::new()),
    };
    let auto_forward = perform_handshake(&session, udp_port, tls_hash).await?;

    let agent = Arc::new(Agent::new());

    if auto_forward {
        info!("auto port forwarding enabled");
        let forwarder = auto_forward::AutoForwarder::new(agent.clone());
        tokio::spawn(forwarder.run());
    }

    agent.add_session(Arc::new(session));

    {
        let agent = agent.clone();
        tokio::spawn(async move {
            if let Err(e) = control_socket::run(agent).await {
                error!(%e, "control socket server failed, agent exiting");
                std::process::exit(1);
            }
        });
    }

    if let Some((endpoint, port, _)) = quic_offer {
        info!(port, "waiting for QUIC connections");
        let agent = agent.clone();
        tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let agent = agent.clone();
                tokio::spawn(async move {
                    let conn = match incoming.await {
                        Ok(conn) => conn,
                        Err(e) => {
                            debug!(%e, "QUIC accept failed");
                            return;
                        }
                    };
                    match Session::new_quic(conn, None, true).await {
                        Ok(session) => {
                            info!("QUIC connection established, adding session");
                            agent.add_session(Arc::new(session));
                        }
                        Err(e) => error!(%e, "failed to create QUIC session"),
                    }
                });
            }
        });
    }

    // Everything from here on is event-driven; the process exits through
    // Shutdown, STOP, or the idle timer.
    std::future::pending::<()>().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pipe_session_pair() -> (Arc<Session>, Arc<Session>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = tokio::spawn(Session::new_pipe(a, false));
        let server = Session::new_pipe(b, true).await.expect("server session");
        (
            Arc::new(client.await.unwrap().expect("client session")),
            Arc::new(server),
        )
    }

    #[tokio::test]
    async fn handshake_acks_matching_version() {
        let (master, slave) = pipe_session_pair().await;

        let slave_task = tokio::spawn(async move {
            perform_handshake(&slave, 60123, "ab".repeat(32)).await
        });

        master
            .send(&ControlMsg::Hello {
                version: PROTOCOL_VERSION.into(),
                auto_forward: true,
            })
            .await
            .expect("send failed");

        match master.receive().await.expect("receive failed") {
            ControlMsg::HelloAck {
                version,
                udp_port,
                tls_hash,
            } => {
                assert_eq!(version, PROTOCOL_VERSION);
                assert_eq!(udp_port, 60123);
                assert_eq!(tls_hash.len(), 64);
            }
            other => panic!("expected HelloAck, got {other:?}"),
        }

        let auto_forward = slave_task
            .await
            .expect("task panicked")
            .expect("handshake failed");
        assert!(auto_forward);
    }

    #[tokio::test]
    async fn handshake_shuts_down_on_version_skew() {
        let (master, slave) = pipe_session_pair().await;

        let slave_task =
            tokio::spawn(async move { perform_handshake(&slave, 0, String::new()).await });

        master
            .send(&ControlMsg::Hello {
                version: "9.9.9".into(),
                auto_forward: false,
            })
            .await
            .expect("send failed");

        match master.receive().await.expect("receive failed") {
            ControlMsg::Shutdown { reason } => assert_eq!(reason, "Version mismatch"),
            other => panic!("expected Shutdown, got {other:?}"),
        }

        let result = slave_task.await.expect("task panicked");
        assert!(matches!(result, Err(Error::Handshake(_))));
    }

    #[tokio::test]
    async fn heartbeat_is_acked() {
        let (master, slave) = pipe_session_pair().await;
        let agent = Arc::new(Agent::new());
        agent.add_session(slave);

        master.send(&ControlMsg::Heartbeat).await.expect("send failed");
        let reply = master.receive().await.expect("receive failed");
        assert_eq!(reply, ControlMsg::HeartbeatAck);
    }

    #[tokio::test]
    async fn list_request_returns_empty_entries() {
        let (master, slave) = pipe_session_pair().await;
        let agent = Arc::new(Agent::new());
        agent.add_session(slave);

        master.send(&ControlMsg::ListRequest).await.expect("send failed");
        match master.receive().await.expect("receive failed") {
            ControlMsg::ListResponse { entries, master_ip } => {
                assert!(entries.is_empty());
                assert!(master_ip.parse::<std::net::IpAddr>().is_ok());
            }
            other => panic!("expected ListResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn responses_route_to_their_channels() {
        let (master, slave) = pipe_session_pair().await;
        let agent = Arc::new(Agent::new());
        agent.add_session(slave);

        master
            .send(&ControlMsg::ListenResponse {
                remote_port: 8080,
                success: true,
                reason: String::new(),
            })
            .await
            .expect("send failed");
        master
            .send(&ControlMsg::CloseResponse {
                port: 9090,
                success: false,
                reason: "unknown port".into(),
            })
            .await
            .expect("send failed");

        let listen = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            agent.listen_rx.lock().await.recv().await
        })
        .await
        .expect("timed out")
        .expect("channel closed");
        assert!(matches!(
            listen,
            ControlMsg::ListenResponse { remote_port: 8080, success: true, .. }
        ));

        let close = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            agent.close_rx.lock().await.recv().await
        })
        .await
        .expect("timed out")
        .expect("channel closed");
        assert!(matches!(
            close,
            ControlMsg::CloseResponse { port: 9090, success: false, .. }
        ));
    }

    #[tokio::test]
    async fn timer_arms_when_last_session_dies_and_cancels_on_new() {
        let (master, slave) = pipe_session_pair().await;
        let agent = Arc::new(Agent::new());
        agent.add_session(slave.clone());
        assert!(!agent.shutdown_timer_armed());

        // Kill the session; the on_remove hook arms the timer.
        agent.sessions.remove(&slave);
        drop(master);
        for _ in 0..50 {
            if agent.shutdown_timer_armed() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(agent.shutdown_timer_armed());
        assert_eq!(agent.sessions.count(), 0);

        // A fresh session cancels it.
        let (_master2, slave2) = pipe_session_pair().await;
        agent.add_session(slave2);
        assert!(!agent.shutdown_timer_armed());
    }
}
