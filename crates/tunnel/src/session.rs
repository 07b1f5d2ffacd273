//! A session: one multiplexer plus its control stream and heartbeat state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use common::Result;
use protocol::ControlMsg;

use crate::{Multiplexer, TransportKind, TunnelStream};

/// Heartbeat send period.
pub const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Liveness window: three missed heartbeats plus slack for clock skew.
pub const LIVENESS_WINDOW: std::time::Duration = std::time::Duration::from_secs(35);

/// Process-unique session identity. Sessions compare by identity, never by
/// value; the manager keys its map on this.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A live tunnel session.
///
/// Stream 0 is opened at construction and reserved for control messages:
/// the server side accepts it, the client side opens it. `send` serializes
/// whole encodes under a mutex so record boundaries are preserved;
/// `receive` refreshes the liveness clock on every decoded message.
pub struct Session {
    id: SessionId,
    mux: Multiplexer,
    control_tx: tokio::sync::Mutex<WriteHalf<TunnelStream>>,
    control_rx: tokio::sync::Mutex<ReadHalf<TunnelStream>>,
    last_received: Mutex<tokio::time::Instant>,
}

impl Session {
    /// Build a session over an already established multiplexer.
    pub async fn new(mux: Multiplexer, server: bool) -> Result<Self> {
        let control = if server {
            mux.accept_stream().await
        } else {
            mux.open_stream().await
        };
        let control = match control {
            Ok(stream) => stream,
            Err(e) => {
                mux.close();
                return Err(e);
            }
        };

        let (control_rx, control_tx) = tokio::io::split(control);
        Ok(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            mux,
            control_tx: tokio::sync::Mutex::new(control_tx),
            control_rx: tokio::sync::Mutex::new(control_rx),
            last_received: Mutex::new(tokio::time::Instant::now()),
        })
    }

    /// Session over the primary transport (a reliable byte pipe).
    pub async fn new_pipe<T>(io: T, server: bool) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(Multiplexer::pipe(io, server), server).await
    }

    /// Session over the secondary transport (an established QUIC
    /// connection). The dialing side passes its endpoint to keep it alive.
    pub async fn new_quic(
        conn: quinn::Connection,
        endpoint: Option<quinn::Endpoint>,
        server: bool,
    ) -> Result<Self> {
        Self::new(Multiplexer::quic(conn, endpoint), server).await
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.mux.kind()
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    /// Send one control message. Whole-message atomicity comes from holding
    /// the encoder mutex for the duration of the encode.
    pub async fn send(&self, msg: &ControlMsg) -> Result<()> {
        let mut control_tx = self.control_tx.lock().await;
        protocol::write_frame(&mut *control_tx, msg).await
    }

    /// Receive the next control message, refreshing the liveness clock.
    pub async fn receive(&self) -> Result<ControlMsg> {
        let mut control_rx = self.control_rx.lock().await;
        let msg = protocol::read_frame(&mut *control_rx).await?;
        *self.last_received.lock().expect("session lock poisoned") = tokio::time::Instant::now();
        Ok(msg)
    }

    /// Close the multiplexer, waking everything blocked on this transport.
    pub fn close(&self) {
        self.mux.close();
    }

    /// Heartbeat loop. Every [`HEARTBEAT_INTERVAL`]: if nothing has been
    /// received for longer than [`LIVENESS_WINDOW`], close the multiplexer
    /// and return. That closure is the death signal every other task on
    /// this session observes. Otherwise send a `Heartbeat`.
    ///
    /// Cancellation stops the loop without closing the multiplexer.
    pub async fn run_heartbeat(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; the first probe should wait a period.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let last = *self.last_received.lock().expect("session lock poisoned");
                    if last.elapsed() > LIVENESS_WINDOW {
                        warn!(
                            session = self.id,
                            transport = %self.kind(),
                            "peer silent past liveness window, closing session"
                        );
                        self.mux.close();
                        return;
                    }
                    if let Err(e) = self.send(&ControlMsg::Heartbeat).await {
                        debug!(session = self.id, %e, "heartbeat send failed");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::PROTOCOL_VERSION;

    async fn pipe_pair() -> (Session, Session) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = tokio::spawn(Session::new_pipe(a, false));
        let server = Session::new_pipe(b, true).await.expect("server session");
        let client = client.await.expect("join failed").expect("client session");
        (client, server)
    }

    #[tokio::test]
    async fn hello_handshake_over_pipe() {
        let (master, slave) = pipe_pair().await;

        master
            .send(&ControlMsg::Hello {
                version: PROTOCOL_VERSION.into(),
                auto_forward: false,
            })
            .await
            .expect("send failed");

        let msg = slave.receive().await.expect("receive failed");
        assert_eq!(
            msg,
            ControlMsg::Hello {
                version: PROTOCOL_VERSION.into(),
                auto_forward: false,
            }
        );

        slave
            .send(&ControlMsg::HelloAck {
                version: PROTOCOL_VERSION.into(),
                udp_port: 0,
                tls_hash: String::new(),
            })
            .await
            .expect("send failed");

        match master.receive().await.expect("receive failed") {
            ControlMsg::HelloAck { version, udp_port, tls_hash } => {
                assert_eq!(version, PROTOCOL_VERSION);
                assert_eq!(udp_port, 0);
                assert!(tls_hash.is_empty());
            }
            other => panic!("expected HelloAck, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn session_ids_are_unique() {
        let (a, b) = pipe_pair().await;
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn kind_labels() {
        let (master, _slave) = pipe_pair().await;
        assert_eq!(master.kind(), TransportKind::Primary);
        assert_eq!(master.kind().label(), "PRIMARY");
        assert_eq!(TransportKind::Secondary.label(), "SECONDARY");
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_closes_silent_session() {
        let (master, slave) = pipe_pair().await;

        // The slave never answers: run only the master's heartbeat.
        let master = std::sync::Arc::new(master);
        let cancel = CancellationToken::new();
        let hb = {
            let master = master.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { master.run_heartbeat(cancel).await })
        };

        // Virtual time: past the liveness window the heartbeat loop closes
        // the multiplexer and exits.
        tokio::time::sleep(LIVENESS_WINDOW + HEARTBEAT_INTERVAL * 2).await;
        hb.await.expect("heartbeat task panicked");

        // The closed multiplexer ends the peer's receive with an error
        // (it first drains whatever heartbeats were already in flight).
        loop {
            if slave.receive().await.is_err() {
                break;
            }
        }
        assert!(master.receive().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_cancellation_leaves_session_open() {
        let (master, slave) = pipe_pair().await;

        let master = std::sync::Arc::new(master);
        let cancel = CancellationToken::new();
        let hb = {
            let master = master.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { master.run_heartbeat(cancel).await })
        };

        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        cancel.cancel();
        hb.await.expect("heartbeat task panicked");

        // The session still works after the heartbeat loop stopped.
        master
            .send(&ControlMsg::Heartbeat)
            .await
            .expect("send failed");
        assert_eq!(
            slave.receive().await.expect("receive failed"),
            ControlMsg::Heartbeat
        );
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_flowing_while_peer_answers() {
        let (master, slave) = pipe_pair().await;

        let cancel = CancellationToken::new();
        let master = std::sync::Arc::new(master);
        let slave = std::sync::Arc::new(slave);

        {
            let master = master.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { master.run_heartbeat(cancel).await });
        }

        // Master-side control loop: draining acks is what refreshes the
        // liveness clock.
        {
            let master = master.clone();
            tokio::spawn(async move { while master.receive().await.is_ok() {} });
        }

        // Echo loop standing in for the peer's control loop.
        {
            let slave = slave.clone();
            tokio::spawn(async move {
                while let Ok(msg) = slave.receive().await {
                    if msg == ControlMsg::Heartbeat
                        && slave.send(&ControlMsg::HeartbeatAck).await.is_err()
                    {
                        break;
                    }
                }
            });
        }

        // Well past the liveness window with a healthy peer: still open.
        tokio::time::sleep(LIVENESS_WINDOW * 3).await;
        assert!(master.send(&ControlMsg::ListRequest).await.is_ok());

        cancel.cancel();
    }
}
