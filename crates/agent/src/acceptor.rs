//! Slave-side stream acceptor: one loop per live session.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error};

use protocol::{StreamHeader, STREAM_ACK, STREAM_NAK};
use tunnel::{Session, TunnelStream};

/// Accept tunnel streams until the multiplexer closes.
pub async fn run(session: Arc<Session>) {
    loop {
        let stream = match session.multiplexer().accept_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(session = session.id(), %e, "stream acceptor exiting");
                return;
            }
        };
        tokio::spawn(handle_stream(stream));
    }
}

/// One forwarded connection: header, dial, status byte, splice.
async fn handle_stream(mut stream: TunnelStream) {
    let header: StreamHeader = match protocol::read_frame(&mut stream).await {
        Ok(header) => header,
        Err(e) => {
            error!(%e, "failed to decode stream header");
            return;
        }
    };

    let target = format!("{}:{}", header.host, header.port);
    let mut conn = match TcpStream::connect(&target).await {
        Ok(conn) => conn,
        Err(e) => {
            error!(%target, %e, "failed to dial target");
            let _ = stream.write_all(&[STREAM_NAK]).await;
            let _ = stream.shutdown().await;
            return;
        }
    };
    let _ = conn.set_nodelay(true);

    if let Err(e) = stream.write_all(&[STREAM_ACK]).await {
        debug!(%target, %e, "failed to send dial ack");
        return;
    }

    match tokio::io::copy_bidirectional(&mut stream, &mut conn).await {
        Ok((from_master, to_master)) => {
            debug!(%target, from_master, to_master, "forward stream finished");
        }
        Err(e) => {
            debug!(%target, %e, "forward stream ended with error");
        }
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn session_pair() -> (Arc<Session>, Arc<Session>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = tokio::spawn(Session::new_pipe(a, false));
        let server = Session::new_pipe(b, true).await.expect("server session");
        (
            Arc::new(client.await.unwrap().expect("client session")),
            Arc::new(server),
        )
    }

    #[tokio::test]
    async fn accepted_stream_splices_to_local_service() {
        let (master, slave) = session_pair().await;
        tokio::spawn(run(slave));

        // Local upper-casing service.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            let upper: Vec<u8> = buf.iter().map(|b| b.to_ascii_uppercase()).collect();
            conn.write_all(&upper).await.unwrap();
        });

        let mut stream = master
            .multiplexer()
            .open_stream()
            .await
            .expect("open failed");
        protocol::write_frame(
            &mut stream,
            &StreamHeader {
                host: "127.0.0.1".into(),
                port,
            },
        )
        .await
        .expect("header write failed");

        let mut status = [0u8; 1];
        stream.read_exact(&mut status).await.expect("status read failed");
        assert_eq!(status[0], STREAM_ACK);

        stream.write_all(b"hello").await.expect("write failed");
        let mut reply = [0u8; 5];
        stream.read_exact(&mut reply).await.expect("read failed");
        assert_eq!(&reply, b"HELLO");
    }

    #[tokio::test]
    async fn dial_failure_naks_the_stream() {
        let (master, slave) = session_pair().await;
        tokio::spawn(run(slave));

        // Grab an ephemeral port and release it: nothing listens there.
        let dead_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut stream = master
            .multiplexer()
            .open_stream()
            .await
            .expect("open failed");
        protocol::write_frame(
            &mut stream,
            &StreamHeader {
                host: "127.0.0.1".into(),
                port: dead_port,
            },
        )
        .await
        .expect("header write failed");

        let mut status = [0u8; 1];
        stream.read_exact(&mut status).await.expect("status read failed");
        assert_eq!(status[0], STREAM_NAK);
    }
}
