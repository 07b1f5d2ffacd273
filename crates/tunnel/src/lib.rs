//! Tunnel subsystem: multiplexed transports, sessions, session manager.
//!
//! Two concrete transports hide behind one capability:
//!
//! - the primary transport multiplexes the slave's stdio pipe (carried by
//!   the outer SSH channel) with a hand-rolled frame protocol;
//! - the secondary transport is a QUIC connection with a pinned ephemeral
//!   certificate, which multiplexes natively.
//!
//! Callers open and accept [`TunnelStream`]s without caring which transport
//! is underneath, except by reading [`TransportKind`].

pub mod manager;
pub mod mux;
pub mod quic;
pub mod session;
pub mod tls;

pub use manager::SessionManager;
pub use mux::{MuxStream, PipeMuxer};
pub use session::{Session, SessionId, HEARTBEAT_INTERVAL, LIVENESS_WINDOW};

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use common::{Error, Result};

/// Which transport a multiplexer rides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Stdio pipe over the outer SSH channel.
    Primary,
    /// Direct QUIC with certificate pinning.
    Secondary,
}

impl TransportKind {
    pub fn label(self) -> &'static str {
        match self {
            TransportKind::Primary => "PRIMARY",
            TransportKind::Secondary => "SECONDARY",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Uniform multiplexer capability over the two transports.
pub enum Multiplexer {
    Pipe(PipeMuxer),
    Quic {
        conn: quinn::Connection,
        /// The dialing side keeps its endpoint alive for the lifetime of
        /// the connection; the accepting side's endpoint is owned by its
        /// accept loop.
        endpoint: Option<quinn::Endpoint>,
    },
}

impl Multiplexer {
    /// Wrap a reliable byte pipe in the primary multiplexer.
    pub fn pipe<T>(io: T, server: bool) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Multiplexer::Pipe(PipeMuxer::new(io, server))
    }

    /// Wrap an established QUIC connection.
    pub fn quic(conn: quinn::Connection, endpoint: Option<quinn::Endpoint>) -> Self {
        Multiplexer::Quic { conn, endpoint }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Multiplexer::Pipe(_) => TransportKind::Primary,
            Multiplexer::Quic { .. } => TransportKind::Secondary,
        }
    }

    /// Open a new outgoing stream.
    pub async fn open_stream(&self) -> Result<TunnelStream> {
        match self {
            Multiplexer::Pipe(mux) => Ok(TunnelStream::Pipe(mux.open_stream()?)),
            Multiplexer::Quic { conn, .. } => {
                let (send, recv) = conn
                    .open_bi()
                    .await
                    .map_err(|e| Error::Transport(format!("QUIC open stream failed: {e}")))?;
                Ok(TunnelStream::Quic { send, recv })
            }
        }
    }

    /// Wait for the peer to open a stream.
    pub async fn accept_stream(&self) -> Result<TunnelStream> {
        match self {
            Multiplexer::Pipe(mux) => mux.accept_stream().await.map(TunnelStream::Pipe),
            Multiplexer::Quic { conn, .. } => {
                let (send, recv) = conn
                    .accept_bi()
                    .await
                    .map_err(|e| Error::Transport(format!("QUIC accept stream failed: {e}")))?;
                Ok(TunnelStream::Quic { send, recv })
            }
        }
    }

    /// Close the multiplexer. This is the authoritative death signal: every
    /// blocked read and accept on this transport wakes up.
    pub fn close(&self) {
        match self {
            Multiplexer::Pipe(mux) => mux.close(),
            Multiplexer::Quic { conn, .. } => {
                conn.close(0u32.into(), b"shutdown");
            }
        }
    }
}

/// One bidirectional ordered stream inside a [`Multiplexer`].
pub enum TunnelStream {
    Pipe(MuxStream),
    Quic {
        send: quinn::SendStream,
        recv: quinn::RecvStream,
    },
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Pipe(s) => Pin::new(s).poll_read(cx, buf),
            TunnelStream::Quic { recv, .. } => Pin::new(recv).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TunnelStream::Pipe(s) => Pin::new(s).poll_write(cx, buf),
            TunnelStream::Quic { send, .. } => AsyncWrite::poll_write(Pin::new(send), cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Pipe(s) => Pin::new(s).poll_flush(cx),
            TunnelStream::Quic { send, .. } => AsyncWrite::poll_flush(Pin::new(send), cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Pipe(s) => Pin::new(s).poll_shutdown(cx),
            TunnelStream::Quic { send, .. } => AsyncWrite::poll_shutdown(Pin::new(send), cx),
        }
    }
}
