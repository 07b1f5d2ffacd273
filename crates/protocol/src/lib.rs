//! Wire protocol for the mpf tunnel control plane.
//!
//! The control stream (stream 0 of every session) carries [`ControlMsg`]
//! values as length-prefixed JSON frames. JSON keeps the control plane
//! self-describing: unknown fields added by a future version are ignored on
//! read, so the two peers only need to agree on the fields they both know.
//!
//! Data streams are opaque byte pipes prefixed with exactly one
//! [`StreamHeader`] frame and a one-byte dial status ([`STREAM_ACK`] /
//! [`STREAM_NAK`]); after that the codec is out of the picture.

pub mod codec;

pub use codec::{read_frame, write_frame, MAX_FRAME_SIZE};

use serde::{Deserialize, Serialize};

/// Current protocol version. Both peers must agree exactly; the slave
/// replies `Shutdown` to a mismatched `Hello`.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Dial succeeded; the stream is now a raw bidirectional pipe.
pub const STREAM_ACK: u8 = 0x01;

/// Dial failed; the stream is closed after this byte.
pub const STREAM_NAK: u8 = 0x00;

/// A message on the control stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ControlMsg {
    /// First message, master -> slave.
    Hello { version: String, auto_forward: bool },
    /// Handshake reply, slave -> master. `udp_port == 0` or an empty
    /// `tls_hash` means no secondary transport is offered.
    HelloAck {
        version: String,
        udp_port: u16,
        tls_hash: String,
    },
    /// Keep-alive probe; answered with `HeartbeatAck`.
    Heartbeat,
    HeartbeatAck,
    /// Ask the peer to open a TCP listener (slave -> master today;
    /// master -> slave is reserved for reverse forwarding).
    ListenRequest {
        local_addr: String,
        remote_host: String,
        remote_port: u16,
        #[serde(default)]
        is_auto: bool,
    },
    ListenResponse {
        remote_port: u16,
        success: bool,
        #[serde(default)]
        reason: String,
    },
    ListRequest,
    ListResponse {
        entries: Vec<ForwardEntry>,
        master_ip: String,
    },
    CloseRequest {
        port: u16,
    },
    CloseResponse {
        port: u16,
        success: bool,
        #[serde(default)]
        reason: String,
    },
    /// Terminates the receiver's session loop.
    Shutdown { reason: String },
}

/// One row of the master's forward table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ForwardEntry {
    pub local_addr: String,
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default)]
    pub is_auto: bool,
    /// Bind failure reason, empty when the listener is live.
    #[serde(default)]
    pub error: String,
    /// Transport label of the best session at snapshot time, or "NONE".
    #[serde(default)]
    pub transport: String,
}

/// Sent as the first frame of every data stream: the address the accepting
/// peer dials before splicing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StreamHeader {
    pub host: String,
    pub port: u16,
}

/// Path of the agent's local control socket: `{temp_dir}/mpf-{uid}.sock`.
#[cfg(unix)]
pub fn control_socket_path() -> std::path::PathBuf {
    let uid = unsafe { libc::getuid() };
    std::env::temp_dir().join(format!("mpf-{uid}.sock"))
}

/// Best-effort discovery of this host's outward-facing IPv4 address.
///
/// Connecting a UDP socket does not send any packets; it just asks the
/// kernel which source address it would route from.
pub fn local_ip() -> String {
    let fallback = || "127.0.0.1".to_string();
    let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") else {
        return fallback();
    };
    if socket.connect("8.8.8.8:80").is_err() {
        return fallback();
    }
    match socket.local_addr() {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => fallback(),
    }
}
