//! Stream multiplexer over a reliable byte pipe.
//!
//! The primary transport is the slave process's stdio, ferried by the outer
//! SSH channel. This module turns that single byte pipe into independently
//! closable bidirectional streams: a writer task serializes outgoing
//! [`PipeFrame`]s as length-prefixed rkyv records, a reader task routes
//! incoming frames to per-stream channels and an accept queue.
//!
//! Stream ids are split by direction so the two peers never collide: the
//! client opens even ids starting at 0, the server odd ids starting at 1.
//! The first client-opened stream is therefore always stream 0, which the
//! session layer reserves for control messages.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use common::{Error, Result};

/// Maximum allowed frame size: 1 MiB.
const MAX_FRAME_SIZE: u32 = 1_048_576;

/// Largest payload carried by a single `Data` frame.
const DATA_CHUNK: usize = 65_536;

/// A multiplexed frame on the byte pipe.
///
/// Wire format: `[4 bytes: payload length BE][rkyv-encoded PipeFrame]`.
/// rkyv keeps the per-chunk overhead of the data path small; the typed JSON
/// codec only ever rides *inside* streams.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
#[rkyv(compare(PartialEq), derive(Debug))]
enum PipeFrame {
    /// Peer opened stream `id`.
    Open { id: u32 },
    /// Payload bytes for stream `id`.
    Data { id: u32, data: Vec<u8> },
    /// Peer is done with stream `id`.
    Close { id: u32 },
    /// The whole multiplexer is going down.
    GoAway,
}

struct Shared {
    frame_tx: mpsc::UnboundedSender<PipeFrame>,
    /// Live streams: id -> sender feeding that stream's read side.
    streams: Mutex<HashMap<u32, mpsc::UnboundedSender<Bytes>>>,
    /// Cancelled exactly when the multiplexer dies, whichever side of the
    /// pipe noticed first. All pending reads and accepts wake on it.
    shutdown: CancellationToken,
}

impl Shared {
    /// Tear down: wake accepts, EOF every stream read.
    fn abort(&self) {
        self.shutdown.cancel();
        self.streams.lock().expect("mux lock poisoned").clear();
    }
}

/// Stream multiplexer over any reliable `AsyncRead + AsyncWrite` pipe.
pub struct PipeMuxer {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MuxStream>>,
    next_id: AtomicU32,
}

impl PipeMuxer {
    /// Wrap a byte pipe. `server` decides the id parity for locally opened
    /// streams; by convention the slave is the server.
    pub fn new<T>(io: T, server: bool) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            frame_tx,
            streams: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(write_loop(writer, frame_rx, shared.clone()));
        tokio::spawn(read_loop(reader, shared.clone(), accept_tx));

        Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            next_id: AtomicU32::new(u32::from(server)),
        }
    }

    /// Open a new outgoing stream.
    pub fn open_stream(&self) -> Result<MuxStream> {
        if self.shared.shutdown.is_cancelled() {
            return Err(Error::Transport("multiplexer closed".into()));
        }

        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        self.shared
            .streams
            .lock()
            .expect("mux lock poisoned")
            .insert(id, data_tx);

        self.shared
            .frame_tx
            .send(PipeFrame::Open { id })
            .map_err(|_| Error::Transport("multiplexer closed".into()))?;

        trace!(id, "opened pipe stream");
        Ok(MuxStream::new(id, self.shared.clone(), data_rx))
    }

    /// Wait for the peer to open a stream.
    pub async fn accept_stream(&self) -> Result<MuxStream> {
        let mut accept_rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.shared.shutdown.cancelled() => {
                Err(Error::Transport("multiplexer closed".into()))
            }
            stream = accept_rx.recv() => {
                stream.ok_or_else(|| Error::Transport("multiplexer closed".into()))
            }
        }
    }

    /// Close the multiplexer. Sends a best-effort `GoAway`, then wakes every
    /// pending read and accept on this side.
    pub fn close(&self) {
        let _ = self.shared.frame_tx.send(PipeFrame::GoAway);
        self.shared.abort();
    }

    /// Whether the multiplexer has been closed (by either side).
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut frame_rx: mpsc::UnboundedReceiver<PipeFrame>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(8192);

    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => {
                // Drain anything already queued (GoAway in particular),
                // then stop.
                match frame_rx.try_recv() {
                    Ok(frame) => frame,
                    Err(_) => break,
                }
            }
            frame = frame_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let payload = match rkyv::to_bytes::<rkyv::rancor::Error>(&frame) {
            Ok(p) => p,
            Err(e) => {
                debug!(%e, "failed to encode pipe frame, skipping");
                continue;
            }
        };

        // Coalesce length prefix + payload into a single write.
        buf.clear();
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        if writer.write_all(&buf).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }

    shared.abort();
}

async fn read_loop<R>(
    mut reader: R,
    shared: Arc<Shared>,
    accept_tx: mpsc::UnboundedSender<MuxStream>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            frame = read_pipe_frame(&mut reader) => match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("pipe closed: {e}");
                    break;
                }
            },
        };

        match frame {
            PipeFrame::Open { id } => {
                let (data_tx, data_rx) = mpsc::unbounded_channel();
                shared
                    .streams
                    .lock()
                    .expect("mux lock poisoned")
                    .insert(id, data_tx);
                let stream = MuxStream::new(id, shared.clone(), data_rx);
                if accept_tx.send(stream).is_err() {
                    trace!(id, "accept queue gone, dropping incoming stream");
                }
            }
            PipeFrame::Data { id, data } => {
                let streams = shared.streams.lock().expect("mux lock poisoned");
                match streams.get(&id) {
                    Some(tx) => {
                        // A closed receiver just means the local side dropped
                        // the stream before the peer's Close arrived.
                        let _ = tx.send(Bytes::from(data));
                    }
                    None => trace!(id, "data for unknown stream, dropping"),
                }
            }
            PipeFrame::Close { id } => {
                shared
                    .streams
                    .lock()
                    .expect("mux lock poisoned")
                    .remove(&id);
            }
            PipeFrame::GoAway => {
                debug!("peer sent GoAway");
                break;
            }
        }
    }

    shared.abort();
}

/// Read one length-prefixed rkyv frame from the pipe.
async fn read_pipe_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<PipeFrame> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| Error::Transport(format!("failed to read frame length: {e}")))?;

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::Transport(format!("failed to read frame payload: {e}")))?;

    rkyv::from_bytes::<PipeFrame, rkyv::rancor::Error>(&payload)
        .map_err(|e| Error::Codec(format!("frame decode error: {e}")))
}

/// One bidirectional stream inside a [`PipeMuxer`].
///
/// Reads pull from the per-stream channel fed by the reader task; EOF is
/// the channel closing (peer `Close`, or multiplexer death). Writes enqueue
/// `Data` frames for the writer task and never block.
pub struct MuxStream {
    id: u32,
    shared: Arc<Shared>,
    data_rx: mpsc::UnboundedReceiver<Bytes>,
    readbuf: Bytes,
    write_closed: bool,
}

impl MuxStream {
    fn new(id: u32, shared: Arc<Shared>, data_rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            id,
            shared,
            data_rx,
            readbuf: Bytes::new(),
            write_closed: false,
        }
    }

    /// This stream's id inside the multiplexer.
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.readbuf.is_empty() {
                let n = this.readbuf.len().min(buf.remaining());
                buf.put_slice(&this.readbuf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match this.data_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.readbuf = chunk,
                // Channel closed: peer Close or multiplexer death. EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Err(broken_pipe()));
        }

        let n = buf.len().min(DATA_CHUNK);
        let frame = PipeFrame::Data {
            id: this.id,
            data: buf[..n].to_vec(),
        };
        match this.shared.frame_tx.send(frame) {
            Ok(()) => Poll::Ready(Ok(n)),
            Err(_) => Poll::Ready(Err(broken_pipe())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // Frames are flushed by the writer task as they drain.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.write_closed {
            this.write_closed = true;
            let _ = this.shared.frame_tx.send(PipeFrame::Close { id: this.id });
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.shared
            .streams
            .lock()
            .expect("mux lock poisoned")
            .remove(&self.id);
        if !self.write_closed {
            let _ = self.shared.frame_tx.send(PipeFrame::Close { id: self.id });
        }
    }
}

fn broken_pipe() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "multiplexer closed")
}
